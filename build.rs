fn main() -> Result<(), Box<dyn std::error::Error>> {
    // panics if not linux
    if std::env::consts::OS != "linux" {
        panic!("This program only runs on linux");
    }

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::compile_protos("proto/transcoder.proto")?;
    Ok(())
}
