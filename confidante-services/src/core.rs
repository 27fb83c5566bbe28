//! The server's own JID (e.g. `example.com`). Presence directed at the
//! bare server JID and other non-IQ stanzas addressed to it fall here,
//! since they don't belong to the roster/disco/session IQ handlers and
//! have nothing else registered to receive them.

use tokio::sync::mpsc;

use confidante_core::xmpp::jid::JidPattern;
use confidante_core::xmpp::stanza::Stanza;

use crate::router::RouterHandle;

const CORE_CHANNEL_BUFFER_SIZE: usize = 8;

/// Registers the server JID as a stanza route and spawns a task that
/// drains it. There is nothing meaningful to do with an IM stanza
/// addressed directly to the server itself beyond not losing track of
/// it, so it is logged and dropped.
pub async fn register(router: &RouterHandle, server_jid: JidPattern) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(CORE_CHANNEL_BUFFER_SIZE);
    router.add_stanza_route(server_jid, tx).await?;

    tokio::spawn(async move {
        while let Some(stanza) = rx.recv().await {
            tracing::debug!(kind = ?stanza.kind(), "stanza addressed to server JID");
        }
    });

    Ok(())
}
