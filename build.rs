fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::compile_protos("proto/raftkv.proto")?;

    // Tell cargo to rerun if the proto file changes
    println!("cargo:rerun-if-changed=proto/raftkv.proto");

    Ok(())
}
