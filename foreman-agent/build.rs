//! This is the build script for the foreman-agent crate.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        // The transport constructors are not generated: the `Connect` RPC
        // would collide with the generated `connect` dial function on the
        // client. Channels are built explicitly and the server's
        // `NamedService` impl is provided in `src/proto.rs`.
        .build_transport(false)
        .type_attribute(
            ".",
            "#[allow(clippy::all, missing_docs, clippy::missing_docs_in_private_items)]",
        )
        .client_mod_attribute(
            ".",
            "#[allow(clippy::all, missing_docs, clippy::missing_docs_in_private_items)]",
        )
        .server_mod_attribute(
            ".",
            "#[allow(clippy::all, missing_docs, clippy::missing_docs_in_private_items)]",
        )
        .compile_protos(&["proto/agent/v1/agent.proto"], &["proto"])?;
    Ok(())
}
