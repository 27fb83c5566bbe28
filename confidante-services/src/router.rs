use std::collections::HashMap;

use anyhow::{Error, anyhow};
use tokio::select;
use tokio::sync::{mpsc, oneshot};

use confidante_core::xml::{Element, namespaces};
use confidante_core::xmpp::jid::{Jid, JidPattern};
use confidante_core::xmpp::stanza::{Stanza, StanzaKind};

const CHANNEL_BUFFER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

type IqName = (String, Option<String>);

struct StanzaRoute {
    id: RouteId,
    pattern: JidPattern,
    handler: mpsc::Sender<Stanza>,
}

/// Owns every piece of mutable routing state. Reached only through
/// `RouterHandle`'s channels, so (as with the reactor this stands in
/// for) at most one task ever mutates a route table at a time.
struct Router {
    stanzas: mpsc::Receiver<Stanza>,
    management: mpsc::Receiver<ManagementCommand>,
    next_route_id: u64,
    stanza_routes: Vec<StanzaRoute>,
    iq_routes: HashMap<IqName, mpsc::Sender<Stanza>>,
    entities: HashMap<Jid, mpsc::Sender<Stanza>>,
    disconnect_listeners: Vec<mpsc::Sender<Jid>>,
}

#[derive(Debug)]
pub enum ManagementCommand {
    Register(Jid, mpsc::Sender<Stanza>),
    Unregister(Jid),
    AddStanzaRoute(JidPattern, mpsc::Sender<Stanza>, oneshot::Sender<RouteId>),
    RemoveStanzaRoute(RouteId),
    AddIqRoute(IqName, mpsc::Sender<Stanza>),
    RemoveIqRoute(IqName),
    AddDisconnectListener(mpsc::Sender<Jid>),
}

impl Router {
    async fn run(&mut self) {
        loop {
            select! {
                Some(stanza) = self.stanzas.recv() => {
                    self.route_stanza(stanza).await;
                }
                Some(command) = self.management.recv() => {
                    self.handle_management_command(command).await;
                }
                else => break,
            }
        }
    }

    /// Mirrors `xmpp_server_route_stanza`/`xmpp_route_stanza` in the
    /// original xmp3 server: IQ get/set is dispatched by the fully
    /// qualified name of its payload; everything else walks the ordered
    /// route list, first match wins, falling back to direct delivery to
    /// a registered (bound) entity.
    async fn route_stanza(&mut self, stanza: Stanza) {
        if stanza.kind() == Some(StanzaKind::Iq)
            && matches!(stanza.stanza_type(), Some("get") | Some("set"))
        {
            return self.route_iq(stanza).await;
        }

        let Some(to) = stanza.to_jid() else {
            tracing::warn!("dropping stanza with no `to` address");
            return;
        };

        if let Some(route) = self
            .stanza_routes
            .iter()
            .find(|route| route.pattern.matches(&to))
        {
            if route.handler.send(stanza).await.is_err() {
                tracing::warn!(%to, "stanza route handler is gone");
            }
            return;
        }

        if let Some(sender) = self.entities.get(&to) {
            if sender.send(stanza).await.is_err() {
                tracing::warn!(%to, "registered entity is gone");
                self.entities.remove(&to);
            }
            return;
        }

        tracing::warn!(%to, "no route for stanza, dropping");
    }

    async fn route_iq(&mut self, stanza: Stanza) {
        let Some(name) = stanza.iq_payload_name() else {
            tracing::warn!("dropping malformed iq get/set with no single payload child");
            return;
        };

        if let Some(handler) = self.iq_routes.get(&name) {
            if handler.send(stanza).await.is_err() {
                tracing::warn!(?name, "iq route handler is gone");
            }
            return;
        }

        tracing::debug!(?name, "no iq route registered, replying service-unavailable");
        self.reply_service_unavailable(stanza_for_error_reply(stanza)).await;
    }

    async fn reply_service_unavailable(&mut self, reply: Option<Stanza>) {
        let Some(reply) = reply else { return };
        let Some(to) = reply.to_jid() else { return };

        if let Some(sender) = self.entities.get(&to) {
            let _ = sender.send(reply).await;
        }
    }

    async fn handle_management_command(&mut self, command: ManagementCommand) {
        match command {
            ManagementCommand::Register(jid, sender) => {
                self.entities.insert(jid, sender);
            }
            ManagementCommand::Unregister(jid) => {
                self.entities.remove(&jid);
                for listener in &self.disconnect_listeners {
                    let _ = listener.send(jid.clone()).await;
                }
            }
            ManagementCommand::AddStanzaRoute(pattern, handler, reply) => {
                if let Some(existing) = self
                    .stanza_routes
                    .iter()
                    .find(|route| route.pattern == pattern)
                {
                    tracing::warn!(?pattern, "stanza route already registered, ignoring");
                    let _ = reply.send(existing.id);
                    return;
                }

                let id = RouteId(self.next_route_id);
                self.next_route_id += 1;
                self.stanza_routes.push(StanzaRoute { id, pattern, handler });
                let _ = reply.send(id);
            }
            ManagementCommand::RemoveStanzaRoute(id) => {
                let before = self.stanza_routes.len();
                self.stanza_routes.retain(|route| route.id != id);
                if self.stanza_routes.len() == before {
                    tracing::warn!(?id, "attempted to remove a stanza route that does not exist");
                }
            }
            ManagementCommand::AddIqRoute(name, handler) => {
                if self.iq_routes.contains_key(&name) {
                    tracing::warn!(?name, "iq route already registered, ignoring");
                } else {
                    self.iq_routes.insert(name, handler);
                }
            }
            ManagementCommand::RemoveIqRoute(name) => {
                if self.iq_routes.remove(&name).is_none() {
                    tracing::warn!(?name, "attempted to remove an iq route that does not exist");
                }
            }
            ManagementCommand::AddDisconnectListener(listener) => {
                self.disconnect_listeners.push(listener);
            }
        }
    }
}

/// Builds an `iq type='error'` reply addressed back to the sender, or
/// `None` if the original stanza did not carry enough addressing
/// information to reply to.
fn stanza_for_error_reply(stanza: Stanza) -> Option<Stanza> {
    let from = stanza.from_jid()?;
    let id = stanza.id()?.to_string();

    let mut error_iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
    error_iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
    error_iq.set_attribute("id", None, id);
    error_iq.set_attribute("type", None, "error".to_string());
    error_iq.set_attribute("to", None, from.to_string());
    error_iq.with_child("error", None, |error| {
        error.set_attribute("type", None, "cancel".to_string());
        error.with_child(
            "service-unavailable",
            Some("urn:ietf:params:xml:ns:xmpp-stanzas"),
            |payload| {
                payload.set_attribute(
                    "xmlns",
                    None,
                    "urn:ietf:params:xml:ns:xmpp-stanzas".to_string(),
                );
            },
        );
    });

    Some(Stanza::new(error_iq))
}

#[derive(Clone)]
pub struct RouterHandle {
    pub stanzas: mpsc::Sender<Stanza>,
    pub management: mpsc::Sender<ManagementCommand>,
}

impl Default for RouterHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterHandle {
    pub fn new() -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (management_tx, management_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            next_route_id: 0,
            stanza_routes: Vec::new(),
            iq_routes: HashMap::new(),
            entities: HashMap::new(),
            disconnect_listeners: Vec::new(),
        };

        tokio::spawn(async move {
            router.run().await;
        });

        RouterHandle {
            stanzas: stanzas_tx,
            management: management_tx,
        }
    }

    pub async fn send_stanza(&self, stanza: Stanza) -> Result<(), Error> {
        self.stanzas
            .send(stanza)
            .await
            .map_err(|_| anyhow!("router is gone"))
    }

    pub async fn add_stanza_route(
        &self,
        pattern: JidPattern,
        handler: mpsc::Sender<Stanza>,
    ) -> Result<RouteId, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.management
            .send(ManagementCommand::AddStanzaRoute(pattern, handler, reply_tx))
            .await
            .map_err(|_| anyhow!("router is gone"))?;
        reply_rx.await.map_err(|_| anyhow!("router is gone"))
    }

    pub async fn remove_stanza_route(&self, id: RouteId) -> Result<(), Error> {
        self.management
            .send(ManagementCommand::RemoveStanzaRoute(id))
            .await
            .map_err(|_| anyhow!("router is gone"))
    }

    pub async fn add_iq_route(
        &self,
        name: (String, Option<String>),
        handler: mpsc::Sender<Stanza>,
    ) -> Result<(), Error> {
        self.management
            .send(ManagementCommand::AddIqRoute(name, handler))
            .await
            .map_err(|_| anyhow!("router is gone"))
    }

    pub async fn remove_iq_route(&self, name: (String, Option<String>)) -> Result<(), Error> {
        self.management
            .send(ManagementCommand::RemoveIqRoute(name))
            .await
            .map_err(|_| anyhow!("router is gone"))
    }

    pub async fn add_disconnect_listener(&self, listener: mpsc::Sender<Jid>) -> Result<(), Error> {
        self.management
            .send(ManagementCommand::AddDisconnectListener(listener))
            .await
            .map_err(|_| anyhow!("router is gone"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn message_to(to: &str) -> Stanza {
        let mut element = Element::new("message", Some(namespaces::XMPP_CLIENT));
        element.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        element.set_attribute("to", None, to.to_string());
        Stanza::new(element)
    }

    async fn recv(rx: &mut mpsc::Receiver<Stanza>) -> Stanza {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("route delivery timed out")
            .expect("route channel closed")
    }

    #[tokio::test]
    async fn delivers_to_registered_entity_when_no_route_matches() {
        let router = RouterHandle::new();
        let (tx, mut rx) = mpsc::channel(1);
        let jid: Jid = "alice@example.com/phone".parse().unwrap();

        router
            .management
            .send(ManagementCommand::Register(jid.clone(), tx))
            .await
            .unwrap();

        router
            .send_stanza(message_to("alice@example.com/phone"))
            .await
            .unwrap();

        let stanza = recv(&mut rx).await;
        assert_eq!(stanza.to_jid().unwrap(), jid);
    }

    #[tokio::test]
    async fn first_matching_stanza_route_wins_in_insertion_order() {
        let router = RouterHandle::new();
        let (first_tx, mut first_rx) = mpsc::channel(1);
        let (second_tx, mut second_rx) = mpsc::channel(1);

        router
            .add_stanza_route("*".parse().unwrap(), first_tx)
            .await
            .unwrap();
        router
            .add_stanza_route("*".parse().unwrap(), second_tx)
            .await
            .unwrap();

        router.send_stanza(message_to("muc.example.com")).await.unwrap();

        recv(&mut first_rx).await;
        assert!(
            timeout(Duration::from_millis(100), second_rx.recv())
                .await
                .is_err(),
            "second route must not receive a stanza the first route already claimed"
        );
    }

    #[tokio::test]
    async fn removed_route_stops_matching() {
        let router = RouterHandle::new();
        let (tx, mut rx) = mpsc::channel(1);

        let id = router
            .add_stanza_route("muc.example.com".parse().unwrap(), tx)
            .await
            .unwrap();
        router.remove_stanza_route(id).await.unwrap();

        let (entity_tx, mut entity_rx) = mpsc::channel(1);
        router
            .management
            .send(ManagementCommand::Register(
                "muc.example.com".parse().unwrap(),
                entity_tx,
            ))
            .await
            .unwrap();

        router.send_stanza(message_to("muc.example.com")).await.unwrap();

        recv(&mut entity_rx).await;
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "removed route must not receive further stanzas"
        );
    }

    #[tokio::test]
    async fn duplicate_stanza_route_pattern_is_rejected() {
        let router = RouterHandle::new();
        let (first_tx, _first_rx) = mpsc::channel(1);
        let (second_tx, _second_rx) = mpsc::channel(1);

        let first_id = router
            .add_stanza_route("muc.example.com".parse().unwrap(), first_tx)
            .await
            .unwrap();
        let second_id = router
            .add_stanza_route("muc.example.com".parse().unwrap(), second_tx)
            .await
            .unwrap();

        assert_eq!(
            first_id, second_id,
            "adding the same pattern twice must not create a second route"
        );

        // Removing the route once is enough to clear it entirely, proving
        // the duplicate add above never became a live second entry.
        router.remove_stanza_route(first_id).await.unwrap();

        let (entity_tx, mut entity_rx) = mpsc::channel(1);
        router
            .management
            .send(ManagementCommand::Register(
                "muc.example.com".parse().unwrap(),
                entity_tx,
            ))
            .await
            .unwrap();

        router.send_stanza(message_to("muc.example.com")).await.unwrap();

        recv(&mut entity_rx).await;
    }

    #[tokio::test]
    async fn iq_get_set_dispatches_by_payload_namespace() {
        let router = RouterHandle::new();
        let (tx, mut rx) = mpsc::channel(1);

        router
            .add_iq_route(
                ("query".to_string(), Some("jabber:iq:roster".to_string())),
                tx,
            )
            .await
            .unwrap();

        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        iq.set_attribute("type", None, "get".to_string());
        iq.set_attribute("id", None, "r1".to_string());
        iq.set_attribute("to", None, "example.com".to_string());
        iq.with_child("query", Some("jabber:iq:roster"), |_| {});

        router.send_stanza(Stanza::new(iq)).await.unwrap();

        let stanza = recv(&mut rx).await;
        assert_eq!(
            stanza.iq_payload_name(),
            Some(("query".to_string(), Some("jabber:iq:roster".to_string())))
        );
    }

    #[tokio::test]
    async fn duplicate_iq_route_does_not_replace_existing_handler() {
        let router = RouterHandle::new();
        let (first_tx, mut first_rx) = mpsc::channel(1);
        let (second_tx, mut second_rx) = mpsc::channel(1);

        router
            .add_iq_route(
                ("query".to_string(), Some("jabber:iq:roster".to_string())),
                first_tx,
            )
            .await
            .unwrap();
        router
            .add_iq_route(
                ("query".to_string(), Some("jabber:iq:roster".to_string())),
                second_tx,
            )
            .await
            .unwrap();

        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        iq.set_attribute("type", None, "get".to_string());
        iq.set_attribute("id", None, "r1".to_string());
        iq.set_attribute("to", None, "example.com".to_string());
        iq.with_child("query", Some("jabber:iq:roster"), |_| {});

        router.send_stanza(Stanza::new(iq)).await.unwrap();

        recv(&mut first_rx).await;
        assert!(
            timeout(Duration::from_millis(100), second_rx.recv())
                .await
                .is_err(),
            "second registration for an already-routed namespace must not replace the first"
        );
    }

    #[tokio::test]
    async fn disconnect_listener_is_notified_on_unregister() {
        let router = RouterHandle::new();
        let (listener_tx, mut listener_rx) = mpsc::channel(1);
        router.add_disconnect_listener(listener_tx).await.unwrap();

        let (entity_tx, _entity_rx) = mpsc::channel(1);
        let jid: Jid = "alice@example.com/phone".parse().unwrap();
        router
            .management
            .send(ManagementCommand::Register(jid.clone(), entity_tx))
            .await
            .unwrap();
        router
            .management
            .send(ManagementCommand::Unregister(jid.clone()))
            .await
            .unwrap();

        let notified = timeout(Duration::from_secs(1), listener_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notified, jid);
    }
}
