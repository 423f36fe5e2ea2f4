// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stand-in image streamer used by the integration tests.
//!
//! Usage: `mock_image_streamer --dir <dir> --num-pipes <n> [--gpu] capture|serve`
//!
//! `capture` stores every file handed to it in `<dir>` until the `ckpt`
//! marker appears, then writes one compressed image and exits.
//! `serve` answers file requests from `<dir>` and exits once it has been
//! idle for a while after its first request.

use std::fs::{self, File};
use std::io::{self, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use checkpointd_core::dump::STREAM_READY_FILE;
use checkpointd_core::img_streamer::Img_streamer_request_entry;
use checkpointd_core::streamer::StreamerMode;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use protobuf::Message;

/// Image written by `capture` after the metadata files.
const IMAGE_NAME: &str = "pages-1.img.lz4";
const IMAGE_BYTES: &[u8] = b"mock lz4 page image";

const ACCEPT_INTERVAL: Duration = Duration::from_millis(10);
/// Time `capture` keeps running after the marker, as a real drain would.
const DRAIN_DELAY: Duration = Duration::from_millis(50);
const SERVE_IDLE: Duration = Duration::from_millis(300);
const GIVE_UP: Duration = Duration::from_secs(30);

struct Args {
    dir: PathBuf,
    mode: StreamerMode,
}

fn parse_args() -> Option<Args> {
    let mut dir = None;
    let mut mode = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dir" => dir = args.next().map(PathBuf::from),
            "--num-pipes" => {
                args.next()?.parse::<u32>().ok()?;
            }
            "--gpu" => {}
            "capture" => mode = Some(StreamerMode::Capture),
            "serve" => mode = Some(StreamerMode::Serve),
            _ => return None,
        }
    }
    Some(Args { dir: dir?, mode: mode? })
}

/// Read one request and the descriptor that follows it.
fn handshake(conn: &mut UnixStream) -> io::Result<(String, OwnedFd)> {
    let mut len = [0u8; 4];
    conn.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    conn.read_exact(&mut body)?;
    let entry = Img_streamer_request_entry::parse_from_bytes(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut space = nix::cmsg_space!([RawFd; 1]);
    let mut buf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg = recvmsg::<()>(conn.as_raw_fd(), &mut iov, Some(&mut space), MsgFlags::empty())
        .map_err(io::Error::from)?;
    let fd = msg
        .cmsgs()
        .map_err(io::Error::from)?
        .find_map(|c| match c {
            ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
            _ => None,
        })
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no descriptor passed"))?;

    // SAFETY: the kernel just installed this descriptor for us.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok((entry.filename().to_string(), fd))
}

fn capture_one(dir: &Path, mut conn: UnixStream) -> io::Result<()> {
    let (name, fd) = handshake(&mut conn)?;
    let mut body = Vec::new();
    File::from(fd).read_to_end(&mut body)?;
    fs::write(dir.join(&name), &body)?;
    eprintln!("captured {} ({} bytes)", name, body.len());
    Ok(())
}

fn serve_one(dir: &Path, mut conn: UnixStream) -> io::Result<()> {
    let (name, fd) = handshake(&mut conn)?;
    let body = fs::read(dir.join(&name))?;
    File::from(fd).write_all(&body)?;
    eprintln!("served {} ({} bytes)", name, body.len());
    Ok(())
}

fn accept(listener: &UnixListener) -> io::Result<Option<UnixStream>> {
    match listener.accept() {
        Ok((conn, _)) => {
            conn.set_nonblocking(false)?;
            Ok(Some(conn))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

fn capture(dir: &Path, listener: &UnixListener) -> io::Result<()> {
    let deadline = Instant::now() + GIVE_UP;
    loop {
        // Checked before accepting so every file sent ahead of the marker
        // is drained first.
        let done = dir.join(STREAM_READY_FILE).exists();
        match accept(listener)? {
            Some(conn) => capture_one(dir, conn)?,
            None if done => break,
            None if Instant::now() > deadline => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "marker never appeared"))
            }
            None => thread::sleep(ACCEPT_INTERVAL),
        }
    }

    fs::write(dir.join(IMAGE_NAME), IMAGE_BYTES)?;
    thread::sleep(DRAIN_DELAY);
    Ok(())
}

fn serve(dir: &Path, listener: &UnixListener) -> io::Result<()> {
    let started = Instant::now();
    let mut last_served: Option<Instant> = None;
    loop {
        match accept(listener)? {
            Some(conn) => {
                serve_one(dir, conn)?;
                last_served = Some(Instant::now());
            }
            None => {
                let idle = match last_served {
                    Some(at) => at.elapsed() > SERVE_IDLE,
                    None => started.elapsed() > GIVE_UP,
                };
                if idle {
                    return Ok(());
                }
                thread::sleep(ACCEPT_INTERVAL);
            }
        }
    }
}

fn run(args: &Args) -> io::Result<()> {
    let socket = args.dir.join(args.mode.socket_name());
    match fs::remove_file(&socket) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(&socket)?;
    listener.set_nonblocking(true)?;
    eprintln!("{} listening on {}", args.mode.as_arg(), socket.display());

    let result = match args.mode {
        StreamerMode::Capture => capture(&args.dir, &listener),
        StreamerMode::Serve => serve(&args.dir, &listener),
    };
    let _ = fs::remove_file(&socket);
    result
}

fn main() -> ExitCode {
    let Some(args) = parse_args() else {
        eprintln!("usage: mock_image_streamer --dir <dir> --num-pipes <n> [--gpu] capture|serve");
        return ExitCode::from(2);
    };
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", args.mode.as_arg(), e);
            ExitCode::FAILURE
        }
    }
}
