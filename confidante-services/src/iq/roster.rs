//! Roster query (`jabber:iq:roster`). No roster storage exists in this
//! core (persisting contact lists across restarts is out of scope), so
//! every `get` is answered with an empty roster.

use confidante_core::xmpp::stanza::Stanza;

use super::result_shell;

const ROSTER_NAMESPACE: &str = "jabber:iq:roster";

pub fn handle(request: &Stanza) -> Stanza {
    let mut iq = result_shell(request);
    iq.with_child("query", Some(ROSTER_NAMESPACE), |query| {
        query.set_attribute("xmlns", None, ROSTER_NAMESPACE.to_string());
    });
    Stanza::new(iq)
}

#[cfg(test)]
mod tests {
    use confidante_core::xml::{Element, namespaces};

    use super::*;

    #[test]
    fn roster_get_returns_empty_query() {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        iq.set_attribute("type", None, "get".to_string());
        iq.set_attribute("id", None, "roster1".to_string());
        iq.set_attribute("from", None, "alice@example.com/phone".to_string());
        iq.with_child("query", Some("jabber:iq:roster"), |_| {});

        let response = handle(&Stanza::new(iq));
        assert_eq!(response.stanza_type(), Some("result"));
        assert!(
            response
                .element
                .find_child("query", Some(ROSTER_NAMESPACE))
                .is_some()
        );
    }
}
