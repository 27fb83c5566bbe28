//! Legacy RFC 3921 session establishment (`urn:ietf:params:xml:ns:xmpp-session`).
//!
//! RFC 6121 obsoletes this exchange, but a lot of deployed clients still
//! send it unconditionally before routing any other stanza. Modelled as
//! an ordinary built-in IQ handler rather than a stream-feature
//! negotiator: there is nothing to negotiate, it always succeeds.

use confidante_core::xmpp::stanza::Stanza;

use super::result_shell;

pub fn handle(request: &Stanza) -> Stanza {
    Stanza::new(result_shell(request))
}

#[cfg(test)]
mod tests {
    use confidante_core::xml::{Element, namespaces};

    use super::*;

    #[test]
    fn session_set_always_succeeds() {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("xmlns", None, namespaces::XMPP_CLIENT.to_string());
        iq.set_attribute("type", None, "set".to_string());
        iq.set_attribute("id", None, "sess1".to_string());
        iq.set_attribute("from", None, "alice@example.com/phone".to_string());
        iq.with_child("session", Some("urn:ietf:params:xml:ns:xmpp-session"), |_| {});

        let response = handle(&Stanza::new(iq));
        assert_eq!(response.stanza_type(), Some("result"));
        assert_eq!(response.id(), Some("sess1"));
        assert_eq!(
            response.to_jid().unwrap().to_string(),
            "alice@example.com/phone"
        );
    }
}
