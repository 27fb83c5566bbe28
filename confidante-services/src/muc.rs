//! In-process Multi-User Chat component, reached through the ordinary
//! stanza dispatch surface like any other registered handler. Room
//! semantics beyond basic join/reflect are out of scope for this core;
//! this is the minimal implementation the dispatch contract requires.

use std::collections::HashMap;

use tokio::sync::mpsc;

use confidante_core::xml::{Element, namespaces};
use confidante_core::xmpp::jid::{Jid, JidPattern};
use confidante_core::xmpp::stanza::{Stanza, StanzaKind};

use crate::iq::disco_info::DiscoInfo;
use crate::iq::disco_items::DiscoItems;
use crate::router::RouterHandle;

const MUC_CHANNEL_BUFFER_SIZE: usize = 8;
const MUC_USER_NAMESPACE: &str = "http://jabber.org/protocol/muc#user";

/// `room@muc.subdomain/nick` occupancy: maps the occupant's in-room
/// nickname to the real bare-or-full JID that owns it.
struct Room {
    occupants: HashMap<String, Jid>,
}

struct Muc {
    router: RouterHandle,
    domain: String,
    rooms: HashMap<String, Room>,
    incoming: mpsc::Receiver<Stanza>,
}

impl Muc {
    async fn run(&mut self) {
        while let Some(stanza) = self.incoming.recv().await {
            self.handle_stanza(stanza).await;
        }
    }

    async fn handle_stanza(&mut self, stanza: Stanza) {
        match stanza.kind() {
            Some(StanzaKind::Presence) => self.handle_presence(stanza).await,
            Some(StanzaKind::Message) => self.handle_message(stanza).await,
            _ => tracing::debug!("MUC component ignoring non-groupchat stanza"),
        }
    }

    async fn handle_presence(&mut self, stanza: Stanza) {
        let (Some(to), Some(from)) = (stanza.to_jid(), stanza.from_jid()) else {
            return;
        };
        let Some(room_name) = to.local().map(str::to_string) else {
            return;
        };
        let Some(nick) = to.resource().map(str::to_string) else {
            return;
        };

        let leaving = stanza.stanza_type() == Some("unavailable");
        let room = self
            .rooms
            .entry(room_name.clone())
            .or_insert_with(|| Room {
                occupants: HashMap::new(),
            });

        if leaving {
            room.occupants.remove(&nick);
        } else {
            room.occupants.insert(nick.clone(), from.clone());
        }

        let occupant_jids: Vec<Jid> = room.occupants.values().cloned().collect();
        if room.occupants.is_empty() {
            self.rooms.remove(&room_name);
        }

        for occupant in &occupant_jids {
            let reflected = self.build_occupant_presence(&to, &from, occupant, leaving);
            if self.router.send_stanza(reflected).await.is_err() {
                tracing::warn!(%occupant, "failed to reflect MUC presence");
            }
        }
    }

    fn build_occupant_presence(
        &self,
        room_occupant_jid: &Jid,
        real_jid: &Jid,
        recipient: &Jid,
        leaving: bool,
    ) -> Stanza {
        let mut presence = Element::new("presence", Some(namespaces::XMPP_CLIENT));
        presence.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        presence.set_attribute("from", None, room_occupant_jid.to_string());
        presence.set_attribute("to", None, recipient.to_string());
        if leaving {
            presence.set_attribute("type", None, "unavailable".to_string());
        }
        presence.with_child("x", Some(MUC_USER_NAMESPACE), |x| {
            x.set_attribute("xmlns", None, MUC_USER_NAMESPACE.to_string());
            x.with_child("item", None, |item| {
                item.set_attribute("jid", None, real_jid.to_string());
                item.set_attribute("affiliation", None, "none".to_string());
                item.set_attribute("role", None, "participant".to_string());
            });
        });
        Stanza::new(presence)
    }

    async fn handle_message(&mut self, stanza: Stanza) {
        let (Some(to), Some(from)) = (stanza.to_jid(), stanza.from_jid()) else {
            return;
        };
        let Some(room_name) = to.local() else { return };
        let Some(room) = self.rooms.get(room_name) else {
            tracing::debug!(room = %room_name, "groupchat message to unknown room, dropping");
            return;
        };

        let Some(sender_nick) = room
            .occupants
            .iter()
            .find(|(_, jid)| **jid == from)
            .map(|(nick, _)| nick.clone())
        else {
            tracing::debug!(%from, "groupchat message from non-occupant, dropping");
            return;
        };

        let body = stanza.element.find_child("body", None).map(|b| b.text());
        let room_bare = Jid::new(Some(room_name.to_string()), self.domain.clone(), None);

        let from_occupant = room_bare.bind(sender_nick);
        for occupant in room.occupants.values() {
            let mut reflected = Element::new("message", Some(namespaces::XMPP_CLIENT));
            reflected.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
            reflected.set_attribute("type", None, "groupchat".to_string());
            reflected.set_attribute("from", None, from_occupant.to_string());
            reflected.set_attribute("to", None, occupant.to_string());
            if let Some(body) = &body {
                reflected.with_child("body", None, |b| b.add_text(body.clone()));
            }

            if self.router.send_stanza(Stanza::new(reflected)).await.is_err() {
                tracing::warn!(%occupant, "failed to reflect MUC message");
            }
        }
    }
}

/// Registers the MUC sub-domain as a wildcard stanza route, advertises
/// it via disco#items/disco#info, and spawns the component task.
pub async fn register(
    router: &RouterHandle,
    muc_domain: String,
    disco_info: &DiscoInfo,
    disco_items: &DiscoItems,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(MUC_CHANNEL_BUFFER_SIZE);
    let pattern: JidPattern = format!("*@{muc_domain}/*").parse()?;
    router.add_stanza_route(pattern, tx).await?;

    let muc_jid = Jid::new(None, muc_domain.clone(), None);
    disco_items.register_muc(muc_jid, disco_info);

    let mut muc = Muc {
        router: router.clone(),
        domain: muc_domain,
        rooms: HashMap::new(),
        incoming: rx,
    };
    tokio::spawn(async move { muc.run().await });

    Ok(())
}
