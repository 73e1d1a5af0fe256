use std::io::Result;

fn main() -> Result<()> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let proto_file = format!("{manifest_dir}/proto/messages.proto");
    let proto_dir = format!("{manifest_dir}/proto");

    prost_build::compile_protos(&[proto_file.as_str()], &[proto_dir.as_str()])?;

    println!("cargo:rerun-if-changed=proto/messages.proto");
    Ok(())
}
