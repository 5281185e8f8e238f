// Generates the VideoStreaming service from proto/video_streaming.proto.

fn main() {
    // Vendored protoc, so builds do not depend on a system install.
    // SAFETY: build scripts are single-threaded.
    unsafe {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/video_streaming.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("Failed to compile protos: {e}"));

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");
}
