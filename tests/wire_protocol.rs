// tests/wire_protocol.rs
//
// Framing and message-set behavior: round-trips, the zero-length keepalive,
// malformed headers, and clean-close detection.

use campusgrid::core::{OutputFile, WorkerSpecs};
use campusgrid::protocol::{decode, encode, FramedStream, Message, WireError, HEADER_LEN};
use uuid::Uuid;

fn sample_messages() -> Vec<Message> {
    vec![
        Message::Register {
            name: "lab-pc-7".into(),
            owner_token: "alice".into(),
            specs: WorkerSpecs {
                cpu_cores: 8,
                cpu_model: "Ryzen 7".into(),
                ram_gb: 31.9,
                gpu_name: Some("RTX 3060".into()),
                gpu_memory_gb: Some(12.0),
                has_docker: true,
            },
        },
        Message::Registered {
            worker_id: Uuid::new_v4(),
            message: "Welcome lab-pc-7!".into(),
        },
        Message::Heartbeat {
            worker_id: Uuid::new_v4(),
            status: "idle".into(),
        },
        Message::RequestJob {
            worker_id: Uuid::new_v4(),
        },
        Message::Job {
            job_id: Uuid::new_v4(),
            title: "crunch".into(),
            code: "print('hi')".into(),
            requirements: Some("numpy\n".into()),
            timeout: 300,
            credit_reward: 15,
        },
        Message::NoJob,
        Message::JobResult {
            job_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            success: true,
            output: "done\n".into(),
            error: None,
            files: vec![OutputFile {
                filename: "report.csv".into(),
                size: 4,
                content: "YWJjZA==".into(),
            }],
            execution_time: 1.25,
        },
        Message::JobReceived {
            job_id: Uuid::new_v4(),
        },
        Message::Disconnect,
    ]
}

#[test]
fn every_message_round_trips() {
    for msg in sample_messages() {
        let frame = encode(&msg).unwrap();
        let decoded = decode(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(msg, decoded);
    }
}

#[test]
fn header_is_ten_zero_padded_ascii_digits() {
    let frame = encode(&Message::NoJob).unwrap();
    let header = &frame[..HEADER_LEN];

    assert_eq!(header.len(), 10);
    assert!(header.iter().all(u8::is_ascii_digit));

    let declared: usize = std::str::from_utf8(header).unwrap().parse().unwrap();
    assert_eq!(declared, frame.len() - HEADER_LEN);
}

#[test]
fn unknown_type_tag_is_rejected() {
    assert!(matches!(
        decode(br#"{"type":"warp_drive"}"#),
        Err(WireError::BadPayload(_))
    ));
}

#[test]
fn missing_type_tag_is_rejected() {
    assert!(decode(br#"{"worker_id":"nope"}"#).is_err());
}

#[tokio::test]
async fn framed_stream_round_trips_over_a_socketpair() {
    let (client, server) = tokio::io::duplex(1024 * 1024);
    let mut tx = FramedStream::new(client);
    let mut rx = FramedStream::new(server);

    for msg in sample_messages() {
        tx.send(&msg).await.unwrap();
        let got = rx.recv().await.unwrap().expect("message expected");
        assert_eq!(msg, got);
    }
}

#[tokio::test]
async fn zero_length_frame_reads_as_keepalive() {
    use tokio::io::AsyncWriteExt;

    let (mut raw, server) = tokio::io::duplex(64);
    let mut rx = FramedStream::new(server);

    raw.write_all(b"0000000000").await.unwrap();
    let got = rx.recv().await.unwrap();
    assert_eq!(got, Some(Message::NoJob));
}

#[tokio::test]
async fn garbage_header_is_a_protocol_error() {
    use tokio::io::AsyncWriteExt;

    let (mut raw, server) = tokio::io::duplex(64);
    let mut rx = FramedStream::new(server);

    raw.write_all(b"not-digits").await.unwrap();
    assert!(matches!(rx.recv().await, Err(WireError::BadHeader)));
}

#[tokio::test]
async fn clean_close_at_frame_boundary_reads_as_none() {
    let (client, server) = tokio::io::duplex(64);
    let mut rx = FramedStream::new(server);

    drop(client);
    assert!(rx.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn close_mid_frame_is_an_error() {
    use tokio::io::AsyncWriteExt;

    let (mut raw, server) = tokio::io::duplex(64);
    let mut rx = FramedStream::new(server);

    // Declare 100 bytes, deliver 3, hang up.
    raw.write_all(b"0000000100abc").await.unwrap();
    drop(raw);

    assert!(rx.recv().await.is_err());
}
