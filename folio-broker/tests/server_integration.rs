//! Integration tests for the WebSocket front door.
//!
//! These tests start a real server, connect a scripted engine to the engine
//! listener and real clients to the client listener.

use std::sync::Arc;

use folio_broker::server::{DocumentServer, ServerConfig};
use folio_broker::storage::MemoryStorage;
use folio_broker::BrokerConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DOC: &str = "mem://docs/plan.odt";
const DOC_QUERY: &str = "mem%3A%2F%2Fdocs%2Fplan.odt";

struct TestServer {
    server: Arc<DocumentServer>,
    client_port: u16,
    engine_port: u16,
    _dir: tempfile::TempDir,
}

/// Start a server on free ports.
async fn start_test_server(storage: MemoryStorage) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let clients = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engines = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_port = clients.local_addr().unwrap().port();
    let engine_port = engines.local_addr().unwrap().port();

    let config = ServerConfig {
        broker: BrokerConfig::for_testing(dir.path()),
        unload_retry_attempts: 3,
        unload_retry_delay: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    let server = Arc::new(DocumentServer::new(config, Arc::new(storage)));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(clients, engines).await.unwrap();
    });
    TestServer {
        server,
        client_port,
        engine_port,
        _dir: dir,
    }
}

impl TestServer {
    /// Connect a scripted engine and wait until it sits in the pool.
    async fn connect_engine(&self) -> Socket {
        let url = format!("ws://127.0.0.1:{}", self.engine_port);
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        for _ in 0..200 {
            if self.server.stats().await.engines_waiting > 0 {
                return ws;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine never joined the pool");
    }

    async fn connect_client(&self, query: &str) -> Socket {
        let url = format!("ws://127.0.0.1:{}/?{query}", self.client_port);
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws
    }
}

/// Next data frame as bytes, skipping control frames.
async fn next_frame(ws: &mut Socket) -> Vec<u8> {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return text.as_bytes().to_vec(),
            Message::Binary(data) => return data.to_vec(),
            Message::Close(_) => panic!("unexpected close"),
            _ => continue,
        }
    }
}

async fn next_text(ws: &mut Socket) -> String {
    String::from_utf8(next_frame(ws).await).unwrap()
}

/// Wait for the peer to close the socket.
async fn expect_closed(ws: &mut Socket) {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("socket was not closed"),
        }
    }
}

/// Pull the `child-<id>` session id out of an engine-bound line.
fn session_of(line: &str) -> &str {
    line.strip_prefix("child-")
        .and_then(|rest| rest.split_once(' '))
        .map(|(id, _)| id)
        .unwrap()
}

#[tokio::test]
async fn test_client_without_engine_is_refused() {
    let server = start_test_server(MemoryStorage::new().with_document(DOC, b"x".to_vec())).await;
    let mut client = server.connect_client(&format!("doc={DOC_QUERY}")).await;

    assert_eq!(next_text(&mut client).await, "error: cmd=internal kind=unavailable");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_client_without_document_is_refused() {
    let server = start_test_server(MemoryStorage::new()).await;
    let mut client = server.connect_client("user=u1").await;

    assert_eq!(next_text(&mut client).await, "error: cmd=load kind=syntax");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_load_and_tile_through_sockets() {
    let server = start_test_server(MemoryStorage::new().with_document(DOC, b"x".to_vec())).await;
    let mut engine = server.connect_engine().await;
    let mut client = server
        .connect_client(&format!("doc={DOC_QUERY}&user=u1&name=Ada"))
        .await;

    assert_eq!(next_text(&mut client).await, "editlock: 1");

    client.send(Message::Text("folioclient 1.0".into())).await.unwrap();
    assert_eq!(next_text(&mut client).await, "folioserver 1.0");

    client
        .send(Message::Text(format!("load url={DOC}").into()))
        .await
        .unwrap();
    let load = next_text(&mut engine).await;
    assert!(load.contains(" load url=file://"), "{load}");
    assert!(load.ends_with(&format!("jail={DOC}")), "{load}");
    let session = session_of(&load).to_string();

    engine
        .send(Message::Text(
            format!("client-{session} status: type=text parts=2 current=0").into(),
        ))
        .await
        .unwrap();
    assert_eq!(next_text(&mut client).await, "status: type=text parts=2 current=0");

    let tile = "tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
    client.send(Message::Text(tile.into())).await.unwrap();
    let render = next_text(&mut engine).await;
    assert_eq!(render, format!("{tile} ver=-1 nviewid=0 wid=1"));

    let mut reply = render.replacen("tile ", "tile: ", 1).into_bytes();
    reply.push(b'\n');
    reply.extend_from_slice(&[0x89, b'P', b'N', b'G']);
    engine.send(Message::Binary(reply.clone().into())).await.unwrap();

    assert_eq!(next_frame(&mut client).await, reply);
    let stats = server.server.stats().await;
    assert_eq!(stats.active_documents, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.engines_connected, 1);
}

#[tokio::test]
async fn test_second_client_shares_document_and_engine() {
    let server = start_test_server(MemoryStorage::new().with_document(DOC, b"x".to_vec())).await;
    let mut engine = server.connect_engine().await;

    let mut first = server.connect_client(&format!("doc={DOC_QUERY}")).await;
    assert_eq!(next_text(&mut first).await, "editlock: 1");
    let mut second = server
        .connect_client(&format!("doc={DOC_QUERY}&permission=readonly"))
        .await;
    assert_eq!(next_text(&mut second).await, "editlock: 0");
    assert_eq!(server.server.stats().await.active_documents, 1);

    second.send(Message::Text("takeedit".into())).await.unwrap();
    assert_eq!(next_text(&mut second).await, "error: cmd=takeedit kind=nodocloaded");

    // The first client leaving hands the lock over
    first.close(None).await.unwrap();
    let disconnect = next_text(&mut engine).await;
    assert!(disconnect.ends_with(" disconnect"), "{disconnect}");
    assert_eq!(next_text(&mut second).await, "editlock: 1");
}

#[tokio::test]
async fn test_engine_death_disconnects_clients() {
    let server = start_test_server(MemoryStorage::new().with_document(DOC, b"x".to_vec())).await;
    let mut engine = server.connect_engine().await;
    let mut client = server.connect_client(&format!("doc={DOC_QUERY}")).await;
    assert_eq!(next_text(&mut client).await, "editlock: 1");

    engine.close(None).await.unwrap();
    assert_eq!(next_text(&mut client).await, "error: cmd=internal kind=enginedied");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_shutdown_saves_modified_documents() {
    let storage = MemoryStorage::new().with_document(DOC, b"x".to_vec());
    let server = start_test_server(storage).await;
    let mut engine = server.connect_engine().await;
    let mut client = server.connect_client(&format!("doc={DOC_QUERY}")).await;
    assert_eq!(next_text(&mut client).await, "editlock: 1");

    engine
        .send(Message::Text("statechanged: .uno:ModifiedStatus=true".into()))
        .await
        .unwrap();

    let shutdown = {
        let server = server.server.clone();
        tokio::spawn(async move { server.shutdown().await })
    };

    let save = next_text(&mut engine).await;
    assert!(save.contains(" uno .uno:Save "), "{save}");
    let session = session_of(&save).to_string();
    engine
        .send(Message::Text(
            format!(
                "client-{session} unocommandresult: {{\"commandName\":\".uno:Save\",\"success\":true}}"
            )
            .into(),
        ))
        .await
        .unwrap();

    // The work copy is unchanged and this is not a final save, so nothing is
    // uploaded, but the save still counts as done.
    assert_eq!(timeout(Duration::from_secs(5), shutdown).await.unwrap().unwrap(), 1);
    expect_closed(&mut client).await;
}
