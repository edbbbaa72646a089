//! Test helpers: member fixtures and a mock member server that answers
//! every command query with a canned document.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::Document;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    options::ServerAddress,
    pool::{Pool, PoolOptions},
    topology::{member::MovingAverage, Member},
};

/// A member fixture for selection and snapshot tests.
pub(crate) fn member(address: &str, handshake: Document, ping_ms: u64) -> Member {
    let address = ServerAddress::parse(address).unwrap();
    let pool = Pool::new(address.clone(), PoolOptions::default());
    Member::new(
        address,
        pool,
        handshake,
        MovingAverage::new(Duration::from_millis(ping_ms)),
        true,
    )
}

/// A fake replica set member: accepts connections and answers every query
/// with the currently configured reply document, echoing the request id.
pub(crate) struct MockServer {
    pub(crate) address: ServerAddress,
    reply: Arc<Mutex<Document>>,
    accept_task: tokio::task::JoinHandle<()>,
    connections: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl MockServer {
    pub(crate) async fn start(reply: Document) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        let reply = Arc::new(Mutex::new(reply));
        let connections: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let serving = Arc::clone(&reply);
        let spawned = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let serving = Arc::clone(&serving);
                let task = tokio::spawn(serve_connection(stream, serving));
                spawned.lock().unwrap().push(task);
            }
        });

        Self {
            address,
            reply,
            accept_task,
            connections,
        }
    }

    /// The `host:port` string other members use to refer to this one.
    pub(crate) fn host_string(&self) -> String {
        self.address.to_string()
    }

    pub(crate) fn set_reply(&self, reply: Document) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Stops accepting and severs every open connection, making the member
    /// look crashed.
    pub(crate) fn stop(&self) {
        self.accept_task.abort();
        for task in self.connections.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(mut stream: TcpStream, reply: Arc<Mutex<Document>>) {
    loop {
        let mut header = [0u8; 16];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let request_id = i32::from_le_bytes(header[4..8].try_into().unwrap());

        let body_len = (length as usize).saturating_sub(16);
        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let document = reply.lock().unwrap().clone();
        if stream.write_all(&encode_reply(request_id, &document)).await.is_err() {
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
