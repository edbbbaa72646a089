//! End-to-end check that the process-wide monitor registry stops a live
//! client's monitor. Runs as its own process so draining the registry
//! cannot interfere with other tests' monitors.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, Document};
use replset_client::{shutdown_monitors, ClientOptions, ReplicaSetClient};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// A minimal replica set member: answers every command query with the
/// configured document, echoing the request id.
async fn spawn_member(reply: Arc<Mutex<Document>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, Arc::clone(&reply)));
        }
    });

    host
}

async fn serve_connection(mut stream: TcpStream, reply: Arc<Mutex<Document>>) {
    loop {
        let mut header = [0u8; 16];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let request_id = i32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut body = vec![0u8; (length as usize).saturating_sub(16)];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let document = reply.lock().unwrap().clone();
        if stream
            .write_all(&encode_reply(request_id, &document))
            .await
            .is_err()
        {
            return;
        }
    }
}

fn encode_reply(response_to: i32, document: &Document) -> Vec<u8> {
    let body = bson::to_vec(document).unwrap();
    let length = 16 + 20 + body.len();

    let mut message = Vec::with_capacity(length);
    message.extend_from_slice(&(length as i32).to_le_bytes());
    message.extend_from_slice(&1000i32.to_le_bytes());
    message.extend_from_slice(&response_to.to_le_bytes());
    message.extend_from_slice(&1i32.to_le_bytes()); // OP_REPLY
    message.extend_from_slice(&0i32.to_le_bytes()); // flags
    message.extend_from_slice(&0i64.to_le_bytes()); // cursor id
    message.extend_from_slice(&0i32.to_le_bytes()); // starting from
    message.extend_from_slice(&1i32.to_le_bytes()); // one document
    message.extend_from_slice(&body);
    message
}

#[tokio::test]
async fn shutdown_monitors_stops_a_live_clients_monitor() {
    let reply = Arc::new(Mutex::new(doc! {}));
    let host = spawn_member(Arc::clone(&reply)).await;
    *reply.lock().unwrap() = doc! {
        "ok": 1,
        "ismaster": true,
        "setName": "rs0",
        "hosts": vec![host.clone()],
    };

    let options = ClientOptions::parse(&host, "rs0").unwrap();
    let client = ReplicaSetClient::connect(options).await.unwrap();
    assert!(client.primary().is_some());

    shutdown_monitors();

    // With the monitor stopped, forgetting the primary leaves nobody to
    // find it again, even though the member is still healthy. A live
    // monitor would have restored it within milliseconds of the wake-up
    // that disconnect() fires.
    client.disconnect();
    assert!(client.primary().is_none());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.primary().is_none());

    client.close().await;
}
