//! Service discovery info (`http://jabber.org/protocol/disco#info`).

use std::sync::{Arc, Mutex};

use confidante_core::xmpp::stanza::Stanza;

use super::result_shell;

const DISCO_INFO_NAMESPACE: &str = "http://jabber.org/protocol/disco#info";

/// Shared, mutable set of advertised feature namespaces. Modules and the
/// MUC component add their own feature var as they register; read back
/// here on every `disco#info` query.
#[derive(Clone)]
pub struct DiscoInfo {
    features: Arc<Mutex<Vec<String>>>,
}

impl DiscoInfo {
    pub fn new() -> Self {
        DiscoInfo {
            features: Arc::new(Mutex::new(vec![DISCO_INFO_NAMESPACE.to_string()])),
        }
    }

    pub fn add_feature(&self, feature: impl Into<String>) {
        let feature = feature.into();
        let mut features = self.features.lock().unwrap();
        if !features.contains(&feature) {
            features.push(feature);
        }
    }
}

impl Default for DiscoInfo {
    fn default() -> Self {
        Self::new()
    }
}

pub fn handle(request: &Stanza, disco: &DiscoInfo) -> Stanza {
    let mut iq = result_shell(request);
    let features = disco.features.lock().unwrap().clone();

    iq.with_child("query", Some(DISCO_INFO_NAMESPACE), |query| {
        query.set_attribute("xmlns", None, DISCO_INFO_NAMESPACE.to_string());
        query.with_child("identity", None, |identity| {
            identity.set_attribute("category", None, "server".to_string());
            identity.set_attribute("type", None, "im".to_string());
        });
        for feature in features {
            query.with_child("feature", None, |feature_element| {
                feature_element.set_attribute("var", None, feature);
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
        iq.set_attribute("id", None, "disco1".to_string());
        iq.set_attribute("from", None, "alice@example.com/phone".to_string());
        iq.with_child("query", Some(DISCO_INFO_NAMESPACE), |_| {});
        Stanza::new(iq)
    }

    #[test]
    fn reports_server_identity_and_registered_features() {
        let disco = DiscoInfo::new();
        disco.add_feature("jabber:iq:roster");

        let response = handle(&disco_get(), &disco);
        let query = response
            .element
            .find_child("query", Some(DISCO_INFO_NAMESPACE))
            .unwrap();

        assert!(query.find_child("identity", None).is_some());
        let feature_vars: Vec<&str> = query
            .child_elements()
            .filter(|child| child.validate("feature", None))
            .map(|child| child.attribute("var", None).unwrap())
            .collect();
        assert!(feature_vars.contains(&"jabber:iq:roster"));
        assert!(feature_vars.contains(&DISCO_INFO_NAMESPACE));
    }

    #[test]
    fn does_not_duplicate_a_feature_added_twice() {
        let disco = DiscoInfo::new();
        disco.add_feature("jabber:iq:roster");
        disco.add_feature("jabber:iq:roster");
        assert_eq!(disco.features.lock().unwrap().len(), 2);
    }
}
