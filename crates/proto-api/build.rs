use std::{env, path::PathBuf};

use anyhow::Result;

fn main() -> Result<()> {
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    println!("cargo:rerun-if-changed=../../proto/agent_api.proto");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    let agent_api_files = ["../../proto/agent_api.proto"];
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .file_descriptor_set_path(out_dir.join("agent_api_descriptor.bin"))
        .protoc_arg("--experimental_allow_proto3_optional")
        .compile_protos(&agent_api_files, &["../../proto"])?;

    Ok(())
}
