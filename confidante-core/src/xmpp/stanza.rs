use crate::xml::{Element, namespaces};
use crate::xmpp::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// A top-level `jabber:client` stanza, wrapping its parsed XML tree.
#[derive(Debug)]
pub struct Stanza {
    pub element: Element,
}

impl Stanza {
    pub fn new(element: Element) -> Self {
        Stanza { element }
    }

    pub fn kind(&self) -> Option<StanzaKind> {
        if self.element.validate("message", Some(namespaces::XMPP_CLIENT)) {
            Some(StanzaKind::Message)
        } else if self
            .element
            .validate("presence", Some(namespaces::XMPP_CLIENT))
        {
            Some(StanzaKind::Presence)
        } else if self.element.validate("iq", Some(namespaces::XMPP_CLIENT)) {
            Some(StanzaKind::Iq)
        } else {
            None
        }
    }

    pub fn from_jid(&self) -> Option<Jid> {
        self.element.attribute("from", None)?.parse().ok()
    }

    pub fn to_jid(&self) -> Option<Jid> {
        self.element.attribute("to", None)?.parse().ok()
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attribute("id", None)
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attribute("type", None)
    }

    /// Overwrites the `from` attribute, as the router does for every
    /// stanza it accepts from an authenticated client.
    pub fn set_from(&mut self, jid: &Jid) {
        self.element
            .set_attribute("from", None, jid.to_string());
    }

    /// The fully-qualified name (local name, namespace) of an IQ
    /// get/set's single payload child, used to key the IQ route table.
    pub fn iq_payload_name(&self) -> Option<(String, Option<String>)> {
        if self.kind() != Some(StanzaKind::Iq) {
            return None;
        }

        let mut children = self.element.child_elements();
        let only_child = children.next()?;
        if children.next().is_some() {
            return None;
        }

        Some((
            only_child.name().to_string(),
            only_child.namespace().map(str::to_string),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq_get(child_name: &str, child_namespace: &str) -> Stanza {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        iq.set_attribute("type", None, "get".to_string());
        iq.set_attribute("id", None, "req1".to_string());
        iq.set_attribute("from", None, "alice@example.com/phone".to_string());
        iq.set_attribute("to", None, "example.com".to_string());
        iq.with_child(child_name, Some(child_namespace), |_| {});

        Stanza::new(iq)
    }

    #[test]
    fn recognizes_iq_kind() {
        let stanza = iq_get("query", "jabber:iq:roster");
        assert_eq!(stanza.kind(), Some(StanzaKind::Iq));
    }

    #[test]
    fn extracts_addressing_and_id() {
        let stanza = iq_get("query", "jabber:iq:roster");
        assert_eq!(stanza.from_jid().unwrap().to_string(), "alice@example.com/phone");
        assert_eq!(stanza.to_jid().unwrap().to_string(), "example.com");
        assert_eq!(stanza.id(), Some("req1"));
        assert_eq!(stanza.stanza_type(), Some("get"));
    }

    #[test]
    fn iq_payload_name_is_fully_qualified() {
        let stanza = iq_get("query", "jabber:iq:roster");
        assert_eq!(
            stanza.iq_payload_name(),
            Some(("query".to_string(), Some("jabber:iq:roster".to_string())))
        );
    }

    #[test]
    fn set_from_overwrites_existing_attribute() {
        let mut stanza = iq_get("query", "jabber:iq:roster");
        let jid: Jid = "alice@example.com/desktop".parse().unwrap();
        stanza.set_from(&jid);
        assert_eq!(stanza.from_jid().unwrap(), jid);
    }
}
