use comms::{
    MAX_FRAME_LEN,
    msg::{Command, Msg, Payload},
    specs::collective::{CollectiveHeader, CollectiveOp, ReduceOp},
};
use tokio::io::{self, AsyncWriteExt};

#[tokio::test]
async fn control_then_tensor_frames_arrive_in_order() {
    let (one, two) = io::duplex(64);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    let header = CollectiveHeader {
        seq: 3,
        op: CollectiveOp::AllReduce { op: ReduceOp::Sum },
        len: 4,
    };

    let sender = tokio::spawn(async move {
        let data = [1.0, 2.0, 3.0, 4.0];
        tx.send(&Msg::Control(Command::Collective(header))).await?;
        tx.send(&Msg::Data(Payload::Tensor(&data))).await?;
        tx.close().await
    });

    let mut buf: Vec<f32> = Vec::new();

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Control(Command::Collective(got)) => assert_eq!(got, header),
        other => panic!("unexpected msg: {other:?}"),
    }

    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Tensor(nums)) => assert_eq!(nums, [1.0, 2.0, 3.0, 4.0]),
        other => panic!("unexpected msg: {other:?}"),
    }

    sender.await.unwrap().unwrap();

    let eof = rx.recv_into::<Msg, _>(&mut buf).await;
    assert_eq!(eof.unwrap_err().kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn empty_tensor_is_a_valid_frame() {
    let (one, two) = io::duplex(64);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    tx.send(&Msg::Data(Payload::Tensor(&[]))).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Data(Payload::Tensor(nums)) => assert!(nums.is_empty()),
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn error_strings_are_borrowed_from_the_buffer() {
    let (one, two) = io::duplex(64);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    tx.send(&Msg::Err("rank 3 already joined".into()))
        .await
        .unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut buf).await.unwrap() {
        Msg::Err(detail) => assert_eq!(detail, "rank 3 already joined"),
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn oversized_frames_are_refused_before_reading_them() {
    let (mut raw, two) = io::duplex(64);
    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let announced = MAX_FRAME_LEN as u64 + 1;
    raw.write_all(&announced.to_be_bytes()).await.unwrap();

    let mut buf: Vec<f32> = Vec::new();
    let err = rx.recv_into::<Msg<'_>, _>(&mut buf).await.unwrap_err();

    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert!(buf.capacity() < MAX_FRAME_LEN);
}
