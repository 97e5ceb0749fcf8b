// Build script for proto compilation
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc when none is configured
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(false) // Harness is server only
        .compile(
            &["proto/audio_test_harness.proto"],
            &["proto"],
        )?;
    Ok(())
}
