//! Service discovery items (`http://jabber.org/protocol/disco#items`).

use std::sync::{Arc, Mutex};

use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;

use super::disco_info::DiscoInfo;
use super::result_shell;

const DISCO_ITEMS_NAMESPACE: &str = "http://jabber.org/protocol/disco#items";

/// Registered child services (currently: at most the MUC component),
/// surfaced as disco items and folded into the `disco#info` feature set.
#[derive(Clone, Default)]
pub struct DiscoItems {
    muc: Arc<Mutex<Option<Jid>>>,
}

impl DiscoItems {
    pub fn new() -> Self {
        DiscoItems::default()
    }

    pub fn register_muc(&self, jid: Jid, disco_info: &DiscoInfo) {
        *self.muc.lock().unwrap() = Some(jid);
        disco_info.add_feature("http://jabber.org/protocol/muc");
    }
}

pub fn handle(request: &Stanza, disco: &DiscoItems) -> Stanza {
    let mut iq = result_shell(request);
    let muc = disco.muc.lock().unwrap().clone();

    iq.with_child("query", Some(DISCO_ITEMS_NAMESPACE), |query| {
        query.set_attribute("xmlns", None, DISCO_ITEMS_NAMESPACE.to_string());
        if let Some(muc) = muc {
            query.with_child("item", None, |item| {
                item.set_attribute("jid", None, muc.to_string());
            });
        }
    });

    Stanza::new(iq)
}

#[cfg(test)]
mod tests {
    use confidante_core::xml::{Element, namespaces};

    use super::*;

    fn disco_get() -> Stanza {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        iq.set_attribute("type", None, "get".to_string());
        iq.set_attribute("id", None, "disco-items1".to_string());
        iq.set_attribute("from", None, "alice@example.com/phone".to_string());
        iq.with_child("query", Some(DISCO_ITEMS_NAMESPACE), |_| {});
        Stanza::new(iq)
    }

    #[test]
    fn empty_when_no_muc_registered() {
        let response = handle(&disco_get(), &DiscoItems::new());
        let query = response
            .element
            .find_child("query", Some(DISCO_ITEMS_NAMESPACE))
            .unwrap();
        assert_eq!(query.child_elements().count(), 0);
    }

    #[test]
    fn lists_muc_when_registered() {
        let items = DiscoItems::new();
        let info = DiscoInfo::new();
        items.register_muc("conference.example.com".parse().unwrap(), &info);

        let response = handle(&disco_get(), &items);
        let query = response
            .element
            .find_child("query", Some(DISCO_ITEMS_NAMESPACE))
            .unwrap();
        let item = query.child_elements().next().unwrap();
        assert_eq!(item.attribute("jid", None), Some("conference.example.com"));
    }
}
