//! Built-in IQ namespace handlers, each run as its own spawned task
//! reached through a router-registered IQ route keyed by the namespace
//! of the request's payload child.

pub mod disco_info;
pub mod disco_items;
pub mod roster;
pub mod session;

use tokio::sync::mpsc;

use confidante_core::xmpp::stanza::Stanza;

use crate::router::RouterHandle;

const IQ_CHANNEL_BUFFER_SIZE: usize = 8;

/// Spawns a task that receives IQ get/set stanzas from `requests` and
/// replies with whatever `reply` produces, routing the reply back
/// through `router`.
async fn run_iq_handler<F>(
    router: RouterHandle,
    mut requests: mpsc::Receiver<Stanza>,
    reply: F,
) where
    F: Fn(&Stanza) -> Stanza + Send + 'static,
{
    while let Some(request) = requests.recv().await {
        let response = reply(&request);
        if router.send_stanza(response).await.is_err() {
            tracing::warn!("router is gone, stopping iq handler");
            return;
        }
    }
}

fn register<F>(
    router: &RouterHandle,
    name: (&'static str, &'static str),
    reply: F,
) -> impl std::future::Future<Output = anyhow::Result<()>>
where
    F: Fn(&Stanza) -> Stanza + Send + 'static,
{
    let router = router.clone();
    let (tx, rx) = mpsc::channel(IQ_CHANNEL_BUFFER_SIZE);
    let route_name = (name.0.to_string(), Some(name.1.to_string()));

    async move {
        router.add_iq_route(route_name, tx).await?;
        tokio::spawn(run_iq_handler(router, rx, reply));
        Ok(())
    }
}

/// Registers every built-in IQ handler with the router. Called once at
/// server startup.
pub async fn register_builtin_handlers(
    router: &RouterHandle,
    disco_info: disco_info::DiscoInfo,
    disco_items: disco_items::DiscoItems,
) -> anyhow::Result<()> {
    register(router, ("query", "jabber:iq:roster"), roster::handle).await?;
    disco_info.add_feature("jabber:iq:roster");

    register(router, ("session", "urn:ietf:params:xml:ns:xmpp-session"), session::handle).await?;
    disco_info.add_feature("urn:ietf:params:xml:ns:xmpp-session");

    register(router, ("query", "http://jabber.org/protocol/disco#items"), {
        move |request| disco_items::handle(request, &disco_items)
    })
    .await?;
    disco_info.add_feature("http://jabber.org/protocol/disco#items");

    register(router, ("query", "http://jabber.org/protocol/disco#info"), {
        move |request| disco_info::handle(request, &disco_info)
    })
    .await?;
    Ok(())
}

/// Builds an `iq type='result'` reply shell addressed back to the
/// sender of `request`, with `request`'s `id` copied over.
fn result_shell(request: &Stanza) -> confidante_core::xml::Element {
    use confidante_core::xml::{Element, namespaces};

    let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
    iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
    iq.set_attribute("type", None, "result".to_string());
    if let Some(id) = request.id() {
        iq.set_attribute("id", None, id.to_string());
    }
    if let Some(from) = request.from_jid() {
        iq.set_attribute("to", None, from.to_string());
    }
    if let Some(to) = request.to_jid() {
        iq.set_attribute("from", None, to.to_string());
    }
    iq
}
