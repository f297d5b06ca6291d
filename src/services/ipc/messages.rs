//! Типы сообщений протокола i3/sway, которые нужны демону.
//!
//! Разбираются только используемые поля, остальное игнорируется serde.

use crate::events::{WindowEvent, WindowEventType, WindowIdentity};
use serde::Deserialize;

use super::codec::{EventKind, Frame};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WindowProperties {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub window_role: Option<String>,
}

/// Узел дерева контейнеров
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Node {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Wayland-окна sway
    #[serde(default)]
    pub app_id: Option<String>,
    /// Идентификатор X11-окна
    #[serde(default)]
    pub window: Option<u64>,
    #[serde(default)]
    pub window_properties: Option<WindowProperties>,
    #[serde(default)]
    pub marks: Vec<String>,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub floating_nodes: Vec<Node>,
}

impl Node {
    /// Контейнер с клиентским окном, а не рабочий стол или сплит
    pub fn is_window(&self) -> bool {
        matches!(self.node_type.as_str(), "con" | "floating_con")
            && (self.window.is_some() || self.app_id.is_some() || self.window_properties.is_some())
            && self.nodes.is_empty()
    }

    /// Все окна дерева вместе с именами их рабочих столов
    pub fn windows(&self) -> Vec<WindowIdentity> {
        let mut out = Vec::new();
        self.collect(None, &mut out);
        out
    }

    fn collect(&self, workspace: Option<&str>, out: &mut Vec<WindowIdentity>) {
        let workspace = if self.node_type == "workspace" {
            self.name.as_deref()
        } else {
            workspace
        };

        if self.is_window() {
            out.push(self.to_identity(workspace.unwrap_or_default()));
            return;
        }

        for child in self.nodes.iter().chain(self.floating_nodes.iter()) {
            child.collect(workspace, out);
        }
    }

    pub fn to_identity(&self, workspace: &str) -> WindowIdentity {
        let props = self.window_properties.clone().unwrap_or_default();
        let title = props
            .title
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_default();

        let mut identity = WindowIdentity::new(self.id, title);
        identity.window_class = props.class.or_else(|| self.app_id.clone());
        identity.instance = props.instance;
        identity.window_role = props.window_role;
        identity.pid = self.pid;
        identity.workspace = workspace.to_string();
        identity.marks = self.marks.iter().cloned().collect();
        identity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribeReply {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WindowEventPayload {
    pub change: String,
    pub container: Node,
}

impl WindowEventPayload {
    pub fn event_type(&self) -> WindowEventType {
        WindowEventType::from_change(&self.change)
    }

    /// Рабочий стол в событиях не приходит, он известен только из дерева
    pub fn into_event(self) -> WindowEvent {
        let event_type = self.event_type();
        WindowEvent::new(self.container.to_identity(""), event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickEventPayload {
    #[serde(default)]
    pub first: bool,
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShutdownEventPayload {
    #[serde(default)]
    pub change: String,
}

/// Событие оконного менеджера
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmEvent {
    Window(WindowEventPayload),
    Tick(TickEventPayload),
    Shutdown(ShutdownEventPayload),
    /// Остальные подписки не разбираются
    Other(u32),
}

impl WmEvent {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(match frame.event_kind() {
            Some(EventKind::Window) => WmEvent::Window(serde_json::from_slice(&frame.payload)?),
            Some(EventKind::Tick) => WmEvent::Tick(serde_json::from_slice(&frame.payload)?),
            Some(EventKind::Shutdown) => {
                WmEvent::Shutdown(serde_json::from_slice(&frame.payload)?)
            }
            _ => WmEvent::Other(frame.kind),
        })
    }
}
