use anyhow::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=proto/sample.proto");
    println!("cargo:rerun-if-env-changed=REGENERATE_PROTO");

    // The generated code is checked in, regenerate only on request so builds
    // don't need protoc.
    if std::env::var("REGENERATE_PROTO").is_err() {
        return Ok(());
    }

    let proto_file = "proto/sample.proto";
    let proto_dir = "proto";

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("./src/proto")
        .compile_protos(&[proto_file], &[proto_dir])?;

    Ok(())
}
