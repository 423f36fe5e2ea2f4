// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stand-in GPU sidecar used by the integration tests.
//!
//! Usage: `mock_gpu_sidecar <job-id> --port <port>`
//!
//! Behaviour is selected by the job id prefix:
//! - `fail-startup`: exits before listening
//! - `fail-checkpoint`: checkpoint RPC reports failure
//! - `incomplete`: checkpoint succeeds without a checkpoint path
//! - `fail-restore`: restore RPC reports failure
//!
//! Any other id checkpoints into two small files and restores from them.

use std::path::Path;
use std::process::ExitCode;

use checkpointd_core::gpu::{
    framed, next_message, send_message, GpuRestoreStats, SidecarRequest, SidecarResponse,
};
use tokio::net::{TcpListener, TcpStream};

const MEM_FILE: &str = "gpu_mem.bin";
const CKPT_FILE: &str = "gpu_ckpt.json";

fn parse_args() -> Option<(String, u16)> {
    let mut args = std::env::args().skip(1);
    let job_id = args.next()?;
    match (args.next().as_deref(), args.next()) {
        (Some("--port"), Some(port)) => Some((job_id, port.parse().ok()?)),
        _ => None,
    }
}

fn checkpoint(job_id: &str, directory: &str) -> SidecarResponse {
    if job_id.starts_with("fail-checkpoint") {
        return SidecarResponse::failed("device busy");
    }

    let dir = Path::new(directory);
    let mem_path = dir.join(MEM_FILE);
    let ckpt_path = dir.join(CKPT_FILE);
    if let Err(e) = std::fs::write(&mem_path, job_id.as_bytes()) {
        return SidecarResponse::failed(format!("write {}: {}", mem_path.display(), e));
    }

    let mut resp = SidecarResponse::ok();
    resp.mem_path = Some(mem_path.display().to_string());
    if job_id.starts_with("incomplete") {
        return resp;
    }
    if let Err(e) = std::fs::write(&ckpt_path, b"{\"calls\":[]}") {
        return SidecarResponse::failed(format!("write {}: {}", ckpt_path.display(), e));
    }
    resp.ckpt_path = Some(ckpt_path.display().to_string());
    resp
}

fn restore(job_id: &str, directory: &str) -> SidecarResponse {
    if job_id.starts_with("fail-restore") {
        return SidecarResponse::failed("replay failed");
    }

    let dir = Path::new(directory);
    for name in [MEM_FILE, CKPT_FILE] {
        if !dir.join(name).exists() {
            return SidecarResponse::failed(format!("{} missing from {}", name, directory));
        }
    }

    let mut resp = SidecarResponse::ok();
    resp.stats = Some(GpuRestoreStats {
        copy_mem_time_ms: 3,
        replay_calls_time_ms: 1,
    });
    resp
}

async fn serve(job_id: String, conn: TcpStream) {
    let mut conn = framed(conn);
    loop {
        let request: SidecarRequest = match next_message(&mut conn).await {
            Ok(request) => request,
            Err(_) => return,
        };
        println!("{} {}", job_id, request.name());

        let response = match request {
            SidecarRequest::StartupPoll | SidecarRequest::HealthCheck => SidecarResponse::ok(),
            SidecarRequest::Checkpoint { directory } => checkpoint(&job_id, &directory),
            SidecarRequest::Restore { directory } => restore(&job_id, &directory),
        };

        if send_message(&mut conn, &response).await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let Some((job_id, port)) = parse_args() else {
        eprintln!("usage: mock_gpu_sidecar <job-id> --port <port>");
        return ExitCode::from(2);
    };

    if job_id.starts_with("fail-startup") {
        eprintln!("{}: no device available", job_id);
        return ExitCode::FAILURE;
    }

    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("bind 127.0.0.1:{}: {}", port, e);
            return ExitCode::FAILURE;
        }
    };
    println!("{} listening on {}", job_id, port);

    loop {
        match listener.accept().await {
            Ok((conn, _)) => {
                tokio::spawn(serve(job_id.clone(), conn));
            }
            Err(e) => {
                eprintln!("accept: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
}
