use std::pin::Pin;
use std::task::{Context, Poll, ready};

use anyhow::{Error, anyhow};
use rustyxml::{Element as RustyXmlElement, ElementBuilder, Event, Parser, Xml};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;

use crate::xml::{Element, Node, namespaces};
use crate::xmpp::jid::Jid;
use crate::xmpp::stream_header::{LanguageTag, StreamHeader};

use super::Frame;

const READ_BUFFER_SIZE: usize = 4096;

fn is_stream_open_tag(name: &str, namespace: Option<&str>) -> bool {
    name == "stream" && namespace == Some(namespaces::XMPP_STREAMS)
}

impl From<RustyXmlElement> for Element {
    fn from(element: RustyXmlElement) -> Self {
        let children = element
            .children
            .into_iter()
            .map(|child| match child {
                Xml::ElementNode(child) => Node::Element(child.into()),
                Xml::CharacterNode(text) => Node::Text(text),
                Xml::CDATANode(text) => Node::CData(text),
                Xml::CommentNode(text) => Node::Comment(text),
                Xml::PINode(text) => Node::ProcessingInstruction(text),
            })
            .collect();

        Element {
            name: element.name,
            namespace: element.ns,
            attributes: element.attributes,
            children,
        }
    }
}

fn build_stream_header(tag: &rustyxml::StartTag) -> StreamHeader {
    let attribute = |name: &str, namespace: Option<&str>| -> Option<&str> {
        tag.attributes
            .get(&(name.to_string(), namespace.map(str::to_string)))
            .map(String::as_str)
    };

    StreamHeader {
        from: attribute("from", None).and_then(|jid| jid.parse::<Jid>().ok()),
        to: attribute("to", None).and_then(|jid| jid.parse::<Jid>().ok()),
        id: None,
        language: attribute("lang", Some(namespaces::XML)).map(|lang| LanguageTag(lang.to_string())),
    }
}

/// Incremental, namespace-aware XML parser fed arbitrary-sized byte
/// chunks from an `AsyncRead`, yielding stream-open headers and
/// top-level element fragments as they complete.
pub struct RustyXmlStreamParser<R> {
    reader: R,
    read_buffer: Box<[u8]>,
    parser: Parser,
    element_builder: ElementBuilder,
}

impl<R: AsyncRead + Unpin> super::StreamParser<R> for RustyXmlStreamParser<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            read_buffer: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            parser: Parser::new(),
            element_builder: ElementBuilder::new(),
        }
    }

    fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + Unpin> Stream for RustyXmlStreamParser<R> {
    type Item = Result<Frame, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            for parser_result in &mut me.parser {
                match &parser_result {
                    Ok(Event::ElementStart(tag)) if is_stream_open_tag(&tag.name, tag.ns.as_deref()) => {
                        return Poll::Ready(Some(Ok(Frame::StreamStart(build_stream_header(tag)))));
                    }
                    Ok(Event::ElementEnd(tag)) if is_stream_open_tag(&tag.name, tag.ns.as_deref()) => {
                        return Poll::Ready(None);
                    }
                    Err(err) => {
                        return Poll::Ready(Some(Err(anyhow!("xml parse error: {err}"))));
                    }
                    _ => {}
                }

                if let Some(builder_result) = me.element_builder.handle_event(parser_result) {
                    return Poll::Ready(Some(match builder_result {
                        Ok(element) => Ok(Frame::XmlFragment(element.into())),
                        Err(err) => Err(anyhow!("xml element build error: {err}")),
                    }));
                }
            }

            let mut read_buf = ReadBuf::new(&mut me.read_buffer);
            ready!(Pin::new(&mut me.reader).poll_read(cx, &mut read_buf))?;
            let bytes_read = read_buf.filled().len();

            if bytes_read == 0 {
                return Poll::Ready(None);
            }

            let chunk = std::str::from_utf8(read_buf.filled()).map_err(|err| anyhow!(err))?;
            me.parser.feed_str(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use tokio::io::AsyncWriteExt;
    use tokio_stream::StreamExt;

    use crate::xml::stream_parser::StreamParser as _;

    use super::*;

    #[tokio::test]
    async fn parses_stream_header_fed_in_one_chunk() {
        let (mut tx, rx) = duplex(4096);
        let mut parser = RustyXmlStreamParser::new(rx);

        tx.write_all(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com'>",
        )
        .await
        .unwrap();

        let Some(Ok(Frame::StreamStart(header))) = parser.next().await else {
            panic!("expected stream start frame");
        };
        assert_eq!(header.to.unwrap().to_string(), "example.com");
    }

    #[tokio::test]
    async fn parses_stream_header_fed_across_multiple_chunks() {
        let (mut tx, rx) = duplex(4096);
        let mut parser = RustyXmlStreamParser::new(rx);

        let reading = tokio::spawn(async move { parser.next().await.map(|r| r.unwrap()) });

        for chunk in [
            "<stream:stream xmlns='jabber:client' ",
            "xmlns:stream='http://etherx.jabber.org/streams' ",
            "to='example.com'>",
        ] {
            tx.write_all(chunk.as_bytes()).await.unwrap();
        }

        let Some(Frame::StreamStart(header)) = reading.await.unwrap() else {
            panic!("expected stream start frame");
        };
        assert_eq!(header.to.unwrap().to_string(), "example.com");
    }

    #[tokio::test]
    async fn parses_stanza_fragment_after_stream_header() {
        let (mut tx, rx) = duplex(4096);
        let mut parser = RustyXmlStreamParser::new(rx);

        tx.write_all(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        )
        .await
        .unwrap();
        assert!(matches!(parser.next().await, Some(Ok(Frame::StreamStart(_)))));

        tx.write_all(b"<message to='bob@example.com'><body>hi</body></message>")
            .await
            .unwrap();

        let Some(Ok(Frame::XmlFragment(element))) = parser.next().await else {
            panic!("expected xml fragment");
        };
        assert!(element.validate("message", Some("jabber:client")));
        assert_eq!(element.attribute("to", None), Some("bob@example.com"));
    }

    #[tokio::test]
    async fn yields_none_when_peer_closes_stream() {
        let (tx, rx) = duplex(4096);
        let mut parser = RustyXmlStreamParser::new(rx);
        drop(tx);

        assert!(parser.next().await.is_none());
    }
}
