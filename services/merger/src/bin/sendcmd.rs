//! Scratch client: send one request document to a running merger and print
//! the decoded reply.

use ballast::framing::JsonFraming;
use ballast::support::{Framing, Status};
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::process;

fn main() {
    let mut args = env::args().skip(1);
    let (socket, request) = match (args.next(), args.next()) {
        (Some(socket), Some(request)) => (socket, request),
        _ => {
            eprintln!("usage: sendcmd <socket> <request-json>");
            process::exit(2);
        }
    };

    let doc: serde_json::Value =
        serde_json::from_str(&request).expect("request is not valid JSON");

    let mut stream = UnixStream::connect(&socket).expect("connection failed");
    let mut framing = JsonFraming::new();
    stream.write_all(&framing.encode(&doc)).expect("send failed");

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let count = stream.read(&mut chunk).expect("read failed");
        if count == 0 {
            eprintln!("connection closed before a reply arrived");
            process::exit(1);
        }
        buffer.extend_from_slice(&chunk[..count]);

        let (status, docs, consumed) = framing.decode(&buffer);
        buffer.drain(..consumed);
        match status {
            Status::Ok => {
                for doc in docs {
                    println!("{}", doc);
                }
                return;
            }
            Status::Garbage => {
                eprintln!("garbage on the wire");
                process::exit(1);
            }
            Status::Undefined => (),
        }
    }
}
