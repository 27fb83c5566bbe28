//! End-to-end coverage of `InboundStream` driven over an in-memory
//! duplex pipe: no real socket, TLS, or storage backend involved. The
//! "client" side speaks raw XML for outgoing stanzas and reuses the
//! crate's own `RustyXmlStreamParser` to decode whatever the server
//! writes back, the same way a handwritten protocol test would.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::anyhow;
use base64::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio_stream::StreamExt;

use confidante_core::xml::namespaces;
use confidante_core::xml::stream_parser::{Frame, StreamParser as _, rusty_xml::RustyXmlStreamParser};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stream::Connection;
use confidante_inbound::sasl::{StoredPassword, StoredPasswordArgon2, StoredPasswordLookup};
use confidante_inbound::{ConnectionType, InboundStream, InboundStreamSettings};
use confidante_services::iq::disco_info::DiscoInfo;
use confidante_services::iq::disco_items::DiscoItems;
use confidante_services::router::RouterHandle;

/// Wraps one end of an in-process duplex pipe so it satisfies
/// `Connection`. STARTTLS is never offered, matching a plaintext-only
/// listener.
struct TestConnection(tokio::io::DuplexStream);

impl AsyncRead for TestConnection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connection for TestConnection {
    type Upgrade = std::future::Ready<Result<Self, anyhow::Error>>;

    fn upgrade(self) -> Result<Self::Upgrade, anyhow::Error> {
        Err(anyhow!("TLS is not available over the in-memory test pipe"))
    }

    fn is_starttls_allowed(&self) -> bool {
        false
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn is_authenticated(&self) -> bool {
        false
    }
}

/// Hands every lookup the same Argon2 hash, so any bare JID
/// authenticates with the one configured password.
#[derive(Clone, Debug)]
struct StaticPasswordStore {
    argon2_hash: String,
}

impl StoredPasswordLookup for StaticPasswordStore {
    fn get_stored_password_argon2(
        &self,
        _jid: Jid,
    ) -> impl std::future::Future<Output = Result<String, anyhow::Error>> + Send {
        let hash = self.argon2_hash.clone();
        async move { Ok(hash) }
    }

    fn get_stored_password_scram_sha1(
        &self,
        _jid: Jid,
    ) -> impl std::future::Future<Output = Result<String, anyhow::Error>> + Send {
        async move { Err(anyhow!("SCRAM is not exercised by this test store")) }
    }

    fn get_stored_password_scram_sha256(
        &self,
        _jid: Jid,
    ) -> impl std::future::Future<Output = Result<String, anyhow::Error>> + Send {
        async move { Err(anyhow!("SCRAM is not exercised by this test store")) }
    }
}

type ClientReader = RustyXmlStreamParser<ReadHalf<tokio::io::DuplexStream>>;

async fn next_frame(reader: &mut ClientReader) -> Frame {
    tokio::time::timeout(Duration::from_secs(2), reader.next())
        .await
        .expect("timed out waiting for a frame from the server")
        .expect("server closed the stream unexpectedly")
        .expect("server wrote malformed xml")
}

async fn send(writer: &mut WriteHalf<tokio::io::DuplexStream>, xml: &str) {
    writer.write_all(xml.as_bytes()).await.unwrap();
}

async fn open_stream(writer: &mut WriteHalf<tokio::io::DuplexStream>, reader: &mut ClientReader, to: &str) {
    send(
        writer,
        &format!(
            "<stream:stream xmlns='{}' xmlns:stream='{}' to='{to}' version='1.0'>",
            namespaces::XMPP_CLIENT,
            namespaces::XMPP_STREAMS,
        ),
    )
    .await;

    assert!(matches!(next_frame(reader).await, Frame::StreamStart(_)));
}

async fn expect_features(reader: &mut ClientReader) -> confidante_core::xml::Element {
    let Frame::XmlFragment(features) = next_frame(reader).await else {
        panic!("expected a <stream:features/> fragment");
    };
    assert!(features.validate("features", Some(namespaces::XMPP_STREAMS)));
    features
}

/// Spins up a router and an `InboundStream` connected to it through an
/// in-memory pipe, then drives stream negotiation through PLAIN auth
/// and resource binding. Returns the client's ends of the pipe plus the
/// JID the server ended up binding.
async fn connect_and_bind(
    router: RouterHandle,
    domain: &str,
    user: &str,
    password: &str,
    resource: &str,
) -> (ClientReader, WriteHalf<tokio::io::DuplexStream>, Jid) {
    let (server_half, client_half) = tokio::io::duplex(8192);
    let (client_read, mut client_write) = tokio::io::split(client_half);
    let mut client_read: ClientReader = RustyXmlStreamParser::new(client_read);

    let store = StaticPasswordStore {
        argon2_hash: StoredPasswordArgon2::new(password).unwrap().to_string(),
    };
    let settings = InboundStreamSettings {
        connection_type: ConnectionType::Client,
        domain: domain.parse().unwrap(),
        tls_required: false,
    };

    let mut stream = InboundStream::<TestConnection, RustyXmlStreamParser<_>, _>::new(
        TestConnection(server_half),
        router,
        store,
        settings,
    );
    tokio::spawn(async move { stream.handle().await });

    open_stream(&mut client_write, &mut client_read, domain).await;
    let features = expect_features(&mut client_read).await;
    assert!(features.find_child("mechanisms", Some(namespaces::XMPP_SASL)).is_some());

    let payload = BASE64_STANDARD.encode(format!("\0{user}\0{password}"));
    send(
        &mut client_write,
        &format!(
            "<auth xmlns='{}' mechanism='PLAIN'>{payload}</auth>",
            namespaces::XMPP_SASL,
        ),
    )
    .await;

    let Frame::XmlFragment(success) = next_frame(&mut client_read).await else {
        panic!("expected a SASL response fragment");
    };
    assert!(success.validate("success", Some(namespaces::XMPP_SASL)));

    open_stream(&mut client_write, &mut client_read, domain).await;
    let features = expect_features(&mut client_read).await;
    assert!(features.find_child("bind", Some(namespaces::XMPP_BIND)).is_some());

    send(
        &mut client_write,
        &format!(
            "<iq type='set' id='bind1'><bind xmlns='{}'><resource>{resource}</resource></bind></iq>",
            namespaces::XMPP_BIND,
        ),
    )
    .await;

    let Frame::XmlFragment(bind_result) = next_frame(&mut client_read).await else {
        panic!("expected the bind result iq");
    };
    assert!(bind_result.validate("iq", None));
    assert_eq!(bind_result.attribute("type", None), Some("result"));
    let bound_jid: Jid = bind_result
        .find_child("bind", Some(namespaces::XMPP_BIND))
        .and_then(|bind| bind.find_child("jid", None))
        .map(|jid| jid.text())
        .expect("bind result missing jid")
        .parse()
        .unwrap();

    (client_read, client_write, bound_jid)
}

#[tokio::test]
async fn bind_dispatches_iq_and_reports_registered_features() {
    let router = RouterHandle::new();
    let disco_info = DiscoInfo::new();
    let disco_items = DiscoItems::default();
    confidante_services::iq::register_builtin_handlers(&router, disco_info.clone(), disco_items.clone())
        .await
        .unwrap();

    let (mut reader, mut writer, bound_jid) =
        connect_and_bind(router, "localhost", "alice", "s3cr3t!", "work").await;
    assert_eq!(bound_jid.to_string(), "alice@localhost/work");

    send(
        &mut writer,
        "<iq type='get' id='r1'><query xmlns='jabber:iq:roster'/></iq>",
    )
    .await;

    let Frame::XmlFragment(roster_result) = next_frame(&mut reader).await else {
        panic!("expected the roster result iq");
    };
    assert_eq!(roster_result.attribute("id", None), Some("r1"));
    assert_eq!(roster_result.attribute("type", None), Some("result"));
    assert!(
        roster_result
            .find_child("query", Some("jabber:iq:roster"))
            .is_some()
    );

    send(
        &mut writer,
        "<iq type='get' id='d1'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
    )
    .await;

    let Frame::XmlFragment(disco_result) = next_frame(&mut reader).await else {
        panic!("expected the disco#info result iq");
    };
    let query = disco_result
        .find_child("query", Some("http://jabber.org/protocol/disco#info"))
        .expect("disco#info result missing query child");
    let features: Vec<&str> = query
        .child_elements()
        .filter(|child| child.validate("feature", None))
        .filter_map(|child| child.attribute("var", None))
        .collect();
    for expected in [
        "jabber:iq:roster",
        "urn:ietf:params:xml:ns:xmpp-session",
        "http://jabber.org/protocol/disco#items",
        "http://jabber.org/protocol/disco#info",
    ] {
        assert!(features.contains(&expected), "missing feature {expected} in {features:?}");
    }
}

#[tokio::test]
async fn wildcard_muc_route_reflects_presence_to_the_joiner() {
    let router = RouterHandle::new();
    let disco_info = DiscoInfo::new();
    let disco_items = DiscoItems::default();
    confidante_services::muc::register(&router, "muc.localhost".to_string(), &disco_info, &disco_items)
        .await
        .unwrap();

    let (mut reader, mut writer, bound_jid) =
        connect_and_bind(router, "localhost", "bob", "hunter2", "phone").await;

    send(&mut writer, "<presence to='room@muc.localhost/bob'/>").await;

    let Frame::XmlFragment(reflected) = next_frame(&mut reader).await else {
        panic!("expected reflected MUC presence");
    };
    assert!(reflected.validate("presence", Some(namespaces::XMPP_CLIENT)));
    assert_eq!(reflected.attribute("from", None), Some("room@muc.localhost/bob"));
    assert_eq!(reflected.attribute("to", None), Some(bound_jid.to_string().as_str()));
    let item = reflected
        .find_child("x", Some("http://jabber.org/protocol/muc#user"))
        .and_then(|x| x.find_child("item", None))
        .expect("reflected presence missing muc#user item");
    assert_eq!(item.attribute("jid", None), Some(bound_jid.to_string().as_str()));
}

#[tokio::test]
async fn abrupt_disconnect_deregisters_the_entity_and_notifies_listeners() {
    let router = RouterHandle::new();
    let (listener_tx, mut listener_rx) = tokio::sync::mpsc::channel(1);
    router.add_disconnect_listener(listener_tx).await.unwrap();

    let (reader, writer, bound_jid) =
        connect_and_bind(router, "localhost", "carol", "letmein", "laptop").await;

    // Simulate the peer vanishing without a clean stream close.
    drop(reader);
    drop(writer);

    let notified = tokio::time::timeout(Duration::from_secs(2), listener_rx.recv())
        .await
        .expect("timed out waiting for disconnect notification")
        .expect("disconnect listener channel closed");
    assert_eq!(notified, bound_jid);
}
