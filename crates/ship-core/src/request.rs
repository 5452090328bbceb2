//! Request-scoped context record.
//!
//! One `RequestContext` is constructed per slice and passed explicitly into
//! the runner and every tool execution — there is no ambient global. Tools
//! that spawn subprocesses export the fields as `SMA_CTX_*` environment
//! variables so child processes can call back into the local server.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub context_id: String,
    pub request_id: String,
    pub channel: String,
    pub target_id: String,
    pub actor_id: String,
    #[serde(default)]
    pub actor_name: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub server_host: Option<String>,
    #[serde(default)]
    pub server_port: Option<u16>,
}

impl RequestContext {
    /// Derive the context from an inbound platform message.
    pub fn from_message(msg: &crate::types::InboundMessage, request_id: impl Into<String>) -> Self {
        Self {
            context_id: msg.context_id.clone(),
            request_id: request_id.into(),
            channel: msg.channel.clone(),
            target_id: msg.target_id.clone(),
            actor_id: msg.actor_id.clone(),
            actor_name: msg.actor_name.clone(),
            message_id: msg.message_id.clone(),
            thread_id: msg.thread_id,
            server_host: None,
            server_port: None,
        }
    }

    /// Refresh the routing fields from a later message on the same lane
    /// (correction merge keeps delivery pointed at the latest message).
    pub fn update_target(&mut self, msg: &crate::types::InboundMessage) {
        self.channel = msg.channel.clone();
        self.target_id = msg.target_id.clone();
        self.actor_id = msg.actor_id.clone();
        self.actor_name = msg.actor_name.clone();
        self.message_id = msg.message_id.clone();
        self.thread_id = msg.thread_id;
    }

    /// `SMA_CTX_*` environment variables for spawned subprocesses.
    ///
    /// Unset optional fields are omitted rather than exported empty.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("SMA_CTX_CONTEXT_ID".into(), self.context_id.clone()),
            ("SMA_CTX_REQUEST_ID".into(), self.request_id.clone()),
            ("SMA_CTX_CHANNEL".into(), self.channel.clone()),
            ("SMA_CTX_TARGET_ID".into(), self.target_id.clone()),
            ("SMA_CTX_ACTOR_ID".into(), self.actor_id.clone()),
        ];
        if let Some(ref id) = self.message_id {
            vars.push(("SMA_CTX_MESSAGE_ID".into(), id.clone()));
        }
        if let Some(thread) = self.thread_id {
            vars.push(("SMA_CTX_THREAD_ID".into(), thread.to_string()));
        }
        if let Some(ref host) = self.server_host {
            vars.push(("SMA_CTX_SERVER_HOST".into(), host.clone()));
        }
        if let Some(port) = self.server_port {
            vars.push(("SMA_CTX_SERVER_PORT".into(), port.to_string()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InboundMessage;

    fn message() -> InboundMessage {
        InboundMessage {
            context_id: "tg:42".into(),
            channel: "telegram".into(),
            target_id: "42".into(),
            actor_id: "u1".into(),
            actor_name: Some("Sam".into()),
            message_id: Some("m-1".into()),
            thread_id: Some(7),
            text: "hi".into(),
        }
    }

    #[test]
    fn env_vars_include_optionals_only_when_set() {
        let mut ctx = RequestContext::from_message(&message(), "req-1");
        ctx.server_host = Some("127.0.0.1".into());
        ctx.server_port = Some(18789);

        let vars = ctx.env_vars();
        let get = |k: &str| vars.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("SMA_CTX_CONTEXT_ID").unwrap(), "tg:42");
        assert_eq!(get("SMA_CTX_THREAD_ID").unwrap(), "7");
        assert_eq!(get("SMA_CTX_SERVER_PORT").unwrap(), "18789");

        let bare = RequestContext {
            context_id: "c".into(),
            request_id: "r".into(),
            channel: "ws".into(),
            target_id: "t".into(),
            actor_id: "a".into(),
            ..Default::default()
        };
        let vars = bare.env_vars();
        assert!(vars.iter().all(|(k, _)| k != "SMA_CTX_MESSAGE_ID"));
        assert!(vars.iter().all(|(k, _)| k != "SMA_CTX_SERVER_HOST"));
    }

    #[test]
    fn update_target_refreshes_routing() {
        let mut ctx = RequestContext::from_message(&message(), "req-1");
        let mut later = message();
        later.target_id = "99".into();
        later.message_id = Some("m-2".into());
        ctx.update_target(&later);
        assert_eq!(ctx.target_id, "99");
        assert_eq!(ctx.message_id.as_deref(), Some("m-2"));
        // Request id is stable for the whole slice.
        assert_eq!(ctx.request_id, "req-1");
    }
}
