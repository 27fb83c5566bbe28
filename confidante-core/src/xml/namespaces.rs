pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS: &str = "http://www.w3.org/2000/xmlns/";

pub const XMPP_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const XMPP_CLIENT: &str = "jabber:client";
pub const XMPP_SERVER: &str = "jabber:server";
pub const XMPP_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const XMPP_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const XMPP_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const XMPP_STARTTLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
