// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

fn main() {
    protobuf_codegen::Codegen::new()
        .pure()
        .cargo_out_dir("protos")
        .include("proto")
        .input("proto/rpc.proto")
        .input("proto/img_streamer.proto")
        .run_from_script();
}
