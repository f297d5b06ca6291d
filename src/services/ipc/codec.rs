use crate::error::Result;
use crate::scope_error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC: &[u8; 6] = b"i3-ipc";
pub const HEADER_LEN: usize = 14;
/// Старший бит типа отмечает события
pub const EVENT_BIT: u32 = 1 << 31;
/// Ограничение на размер одного сообщения (дерево большого сеанса укладывается с запасом)
pub const MAX_PAYLOAD: u32 = 32 * 1024 * 1024;

/// Типы запросов протокола i3/sway
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    RunCommand = 0,
    GetWorkspaces = 1,
    Subscribe = 2,
    GetOutputs = 3,
    GetTree = 4,
    GetMarks = 5,
    GetVersion = 7,
    SendTick = 10,
}

/// Типы событий (без старшего бита)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Workspace,
    Output,
    Mode,
    Window,
    BarConfig,
    Binding,
    Shutdown,
    Tick,
}

impl EventKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code & !EVENT_BIT {
            0 => Some(EventKind::Workspace),
            1 => Some(EventKind::Output),
            2 => Some(EventKind::Mode),
            3 => Some(EventKind::Window),
            4 => Some(EventKind::BarConfig),
            5 => Some(EventKind::Binding),
            6 => Some(EventKind::Shutdown),
            7 => Some(EventKind::Tick),
            _ => None,
        }
    }

    /// Имя для запроса SUBSCRIBE
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Workspace => "workspace",
            EventKind::Output => "output",
            EventKind::Mode => "mode",
            EventKind::Window => "window",
            EventKind::BarConfig => "barconfig_update",
            EventKind::Binding => "binding",
            EventKind::Shutdown => "shutdown",
            EventKind::Tick => "tick",
        }
    }
}

/// Одно сообщение протокола: тип и сырой JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_event(&self) -> bool {
        self.kind & EVENT_BIT != 0
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        if self.is_event() {
            EventKind::from_code(self.kind)
        } else {
            None
        }
    }
}

/// Кодирует сообщение: magic, длина и тип в порядке байт хоста, затем payload
pub fn encode(kind: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Разбирает заголовок: (длина payload, тип)
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u32, u32)> {
    if &header[..6] != MAGIC {
        return Err(scope_error!(ipc, "неверная сигнатура сообщения: {:?}", &header[..6]));
    }
    let len = u32::from_ne_bytes([header[6], header[7], header[8], header[9]]);
    let kind = u32::from_ne_bytes([header[10], header[11], header[12], header[13]]);
    if len > MAX_PAYLOAD {
        return Err(scope_error!(ipc, "слишком большое сообщение: {} байт", len));
    }
    Ok((len, kind))
}

/// Читает одно сообщение. EOF превращается в ошибку разрыва соединения.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            scope_error!(disconnected, "оконный менеджер закрыл соединение")
        } else {
            e.into()
        }
    })?;

    let (len, kind) = decode_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            scope_error!(disconnected, "соединение оборвалось посреди сообщения")
        } else {
            e.into()
        }
    })?;

    Ok(Frame { kind, payload })
}
