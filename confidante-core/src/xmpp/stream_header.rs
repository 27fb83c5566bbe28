use crate::xmpp::jid::Jid;
use crate::xmpp::stream::StreamId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(pub String);

#[derive(Debug)]
pub struct StreamHeader {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<StreamId>,
    pub language: Option<LanguageTag>,
}
