fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Clients drive the switch; servers back the in-process fake switch used by
    // the integration tests.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/google/rpc/status.proto",
                "proto/p4/config/p4info.proto",
                "proto/p4/runtime.proto",
                "proto/p4/tmp/device.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
