fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }
    let include_path = protoc_bin_vendored::include_path()?;
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".coprocess", "#[derive(serde::Serialize, serde::Deserialize)]")
        .message_attribute(".coprocess", "#[serde(default)]")
        .compile_protos(
            &[
                "../../proto/coprocess/coprocess_common.proto",
                "../../proto/coprocess/coprocess_return_overrides.proto",
                "../../proto/coprocess/coprocess_mini_request_object.proto",
                "../../proto/coprocess/coprocess_response_object.proto",
                "../../proto/coprocess/coprocess_session_state.proto",
                "../../proto/coprocess/coprocess_object.proto",
            ],
            &[
                "../../proto",
                include_path.to_str().ok_or("invalid protoc include path")?,
            ],
        )?;
    println!("cargo:rerun-if-changed=../../proto/coprocess");
    Ok(())
}
