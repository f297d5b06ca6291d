use crate::error::Result;
use crate::scope_error;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::codec::{self, EventKind, Frame, MessageType};
use super::messages::{CommandOutcome, Node, SubscribeReply, WmEvent};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Открытое соединение с оконным менеджером
#[async_trait]
pub trait WmConnection: Send {
    async fn subscribe(&mut self, events: &[EventKind]) -> Result<()>;

    async fn get_tree(&mut self) -> Result<Node>;

    /// Выполняет команду; по одному результату на каждую команду через `;`
    async fn run_command(&mut self, command: &str) -> Result<Vec<CommandOutcome>>;

    async fn send_tick(&mut self, payload: &str) -> Result<()>;

    /// Следующее событие подписки. Безопасно отменяется внутри `select!`.
    async fn next_event(&mut self) -> Result<WmEvent>;
}

/// Фабрика соединений: демон вызывает её при каждом переподключении
#[async_trait]
pub trait WmConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WmConnection>>;
}

/// Подключение к sway или i3 через UNIX-сокет
pub struct SwayConnector {
    socket_path: Option<PathBuf>,
    request_timeout: Duration,
}

impl SwayConnector {
    pub fn new(socket_path: Option<PathBuf>) -> Self {
        Self {
            socket_path,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Путь из настроек, затем SWAYSOCK, затем I3SOCK, затем `sway/i3 --get-socketpath`
    pub async fn resolve_socket_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.socket_path {
            return Ok(path.clone());
        }

        for var in ["SWAYSOCK", "I3SOCK"] {
            if let Some(value) = std::env::var_os(var).filter(|v| !v.is_empty()) {
                return Ok(PathBuf::from(value));
            }
        }

        for binary in ["sway", "i3"] {
            let output = tokio::process::Command::new(binary)
                .arg("--get-socketpath")
                .output()
                .await;
            if let Ok(output) = output {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if output.status.success() && !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }

        Err(scope_error!(
            disconnected,
            "не найден сокет оконного менеджера (SWAYSOCK/I3SOCK не заданы)"
        ))
    }
}

#[async_trait]
impl WmConnector for SwayConnector {
    async fn connect(&self) -> Result<Box<dyn WmConnection>> {
        let path = self.resolve_socket_path().await?;
        debug!("Подключение к {:?}", path);
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| scope_error!(disconnected, "{}: {}", path.display(), e))?;
        Ok(Box::new(
            SwayConnection::new(stream).with_request_timeout(self.request_timeout),
        ))
    }
}

/// Соединение: чтение идёт в отдельной задаче, которая раскладывает
/// ответы и события по двум очередям. События, пришедшие во время
/// ожидания ответа, не теряются.
///
/// Очередь событий не ограничена: читатель никогда не ждёт на ней, и ответ
/// не застревает за событиями, порождёнными тем же запросом (mark/unmark).
pub struct SwayConnection {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Frame>,
    events: mpsc::UnboundedReceiver<Frame>,
    reader: JoinHandle<()>,
    request_timeout: Duration,
}

impl SwayConnection {
    pub fn new(stream: UnixStream) -> Self {
        let (mut read_half, writer) = stream.into_split();
        let (reply_tx, replies) = mpsc::channel(16);
        let (event_tx, events) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            loop {
                let frame = match codec::read_frame(&mut read_half).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Чтение из сокета остановлено: {}", e);
                        break;
                    }
                };

                let sent = if frame.is_event() {
                    trace!("Событие 0x{:08x}, {} байт", frame.kind, frame.payload.len());
                    event_tx.send(frame).is_ok()
                } else {
                    reply_tx.send(frame).await.is_ok()
                };

                if !sent {
                    break;
                }
            }
        });

        Self {
            writer,
            replies,
            events,
            reader,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn request(&mut self, kind: MessageType, payload: &[u8]) -> Result<Vec<u8>> {
        let bytes = codec::encode(kind as u32, payload);
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| scope_error!(disconnected, "запись в сокет: {}", e))?;

        // Оконный менеджер, не отвечающий на запрос, равносилен обрыву:
        // демон переподключится и сверит состояние заново
        let frame = tokio::time::timeout(self.request_timeout, self.replies.recv())
            .await
            .map_err(|_| {
                scope_error!(
                    disconnected,
                    "нет ответа на запрос {} за {:?}",
                    kind as u32,
                    self.request_timeout
                )
            })?
            .ok_or_else(|| scope_error!(disconnected, "соединение закрыто до ответа"))?;

        if frame.kind != kind as u32 {
            return Err(scope_error!(
                ipc,
                "ожидался ответ типа {}, получен {}",
                kind as u32,
                frame.kind
            ));
        }
        Ok(frame.payload)
    }
}

impl Drop for SwayConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl WmConnection for SwayConnection {
    async fn subscribe(&mut self, events: &[EventKind]) -> Result<()> {
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        let payload = serde_json::to_vec(&names)?;
        let reply: SubscribeReply =
            serde_json::from_slice(&self.request(MessageType::Subscribe, &payload).await?)?;
        if !reply.success {
            return Err(scope_error!(ipc, "подписка на {:?} отклонена", names));
        }
        Ok(())
    }

    async fn get_tree(&mut self) -> Result<Node> {
        let payload = self.request(MessageType::GetTree, b"").await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn run_command(&mut self, command: &str) -> Result<Vec<CommandOutcome>> {
        let payload = self
            .request(MessageType::RunCommand, command.as_bytes())
            .await?;
        let outcomes: Vec<CommandOutcome> = serde_json::from_slice(&payload)?;
        for outcome in outcomes.iter().filter(|o| !o.success) {
            warn!(
                "Команда '{}' не выполнена: {}",
                command,
                outcome.error.as_deref().unwrap_or("без описания")
            );
        }
        Ok(outcomes)
    }

    async fn send_tick(&mut self, payload: &str) -> Result<()> {
        self.request(MessageType::SendTick, payload.as_bytes())
            .await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<WmEvent> {
        let frame = self
            .events
            .recv()
            .await
            .ok_or_else(|| scope_error!(disconnected, "поток событий закрыт"))?;
        WmEvent::from_frame(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ipc::codec::EVENT_BIT;
    use tokio::io::AsyncReadExt;

    /// Сервер отвечает на один запрос, но перед ответом шлёт событие
    async fn serve_once(mut server: UnixStream) {
        let mut header = [0u8; codec::HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let (len, kind) = codec::decode_header(&header).unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(kind, MessageType::RunCommand as u32);

        let event = codec::encode(EVENT_BIT | 7, br#"{"first":false,"payload":"scopewm:reload"}"#);
        server.write_all(&event).await.unwrap();
        let reply = codec::encode(kind, br#"[{"success":true}]"#);
        server.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_event_during_request_is_queued() {
        let (client, server) = UnixStream::pair().unwrap();
        let server_task = tokio::spawn(serve_once(server));

        let mut conn = SwayConnection::new(client);
        let outcomes = conn.run_command("nop").await.unwrap();
        assert!(outcomes[0].success);

        match conn.next_event().await.unwrap() {
            WmEvent::Tick(tick) => assert_eq!(tick.payload, "scopewm:reload"),
            other => panic!("ожидался tick: {:?}", other),
        }
        server_task.await.unwrap();
    }

    async fn read_request(server: &mut UnixStream) -> u32 {
        let mut header = [0u8; codec::HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let (len, kind) = codec::decode_header(&header).unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        kind
    }

    #[tokio::test]
    async fn test_reply_behind_event_flood_is_delivered() {
        const FLOOD: usize = 1100;
        let (client, mut server) = UnixStream::pair().unwrap();

        let server_task = tokio::spawn(async move {
            let kind = read_request(&mut server).await;
            let event = codec::encode(
                EVENT_BIT | 7,
                br#"{"first":false,"payload":"scopewm:noop"}"#,
            );
            for _ in 0..FLOOD {
                server.write_all(&event).await.unwrap();
            }
            let reply = codec::encode(kind, br#"[{"success":true}]"#);
            server.write_all(&reply).await.unwrap();
            server
        });

        let mut conn = SwayConnection::new(client);
        let outcomes = tokio::time::timeout(Duration::from_secs(5), conn.run_command("mark --add x"))
            .await
            .expect("ответ застрял за очередью событий")
            .unwrap();
        assert!(outcomes[0].success);

        for _ in 0..FLOOD {
            assert!(matches!(conn.next_event().await.unwrap(), WmEvent::Tick(_)));
        }
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_silent_server_times_out_as_disconnect() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let server_task = tokio::spawn(async move {
            read_request(&mut server).await;
            // Держим сокет открытым и молчим
            tokio::time::sleep(Duration::from_secs(2)).await;
            server
        });

        let mut conn = SwayConnection::new(client).with_request_timeout(Duration::from_millis(50));
        let err = conn.get_tree().await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("нет ответа"));
        server_task.abort();
    }

    #[tokio::test]
    async fn test_closed_socket_is_disconnect() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let mut conn = SwayConnection::new(client);
        let err = conn.next_event().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_explicit_socket_path_wins() {
        let connector = SwayConnector::new(Some(PathBuf::from("/run/user/1000/sway-ipc.sock")));
        assert_eq!(
            connector.resolve_socket_path().await.unwrap(),
            PathBuf::from("/run/user/1000/sway-ipc.sock")
        );
    }
}
