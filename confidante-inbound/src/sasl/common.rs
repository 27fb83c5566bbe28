use std::{io::Cursor, sync::Arc};

use anyhow::{Error, anyhow};
use confidante_core::xmpp::jid::Jid;
use rsasl::{
    callback::SessionCallback,
    config::SASLConfig,
    prelude::{Mechname, MessageSent, SASLServer, State, Validation},
};
use tokio::sync::{mpsc, oneshot};

use crate::sasl::{MechanismNegotiatorResult, StoredPassword};

#[derive(Debug)]
pub enum AuthError {
    AuthzBad,
    PasswordIncorrect,
    NoSuchUser,
}

pub struct SaslValidation;

impl Validation for SaslValidation {
    type Value = Result<String, AuthError>;
}

pub trait SessionCallbackExt {
    fn lookup_stored_password<P>(
        &self,
        authid: &str,
        tx: mpsc::Sender<(String, oneshot::Sender<Result<P, Error>>)>,
    ) -> Result<P, Error>
    where
        P: StoredPassword,
    {
        let (response_tx, response_rx) = oneshot::channel();
        tx.blocking_send((authid.to_string(), response_tx))
            .map_err(|_| anyhow!("Could not lookup stored password"))?;
        let stored_password = response_rx
            .blocking_recv()
            .map_err(|_| anyhow!("Could not lookup stored password"))?;
        stored_password.map_err(|_| anyhow!("Could not lookup stored password"))
    }
}

impl<T> SessionCallbackExt for T where T: SessionCallback {}

pub fn authenticate(
    config: Arc<SASLConfig>,
    mechname: &Mechname,
    resolved_domain: String,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    output_tx: mpsc::Sender<MechanismNegotiatorResult>,
) -> Result<String, Error> {
    let server = SASLServer::<SaslValidation>::new(config);

    let mut server_session = server.start_suggested(mechname)?;
    let mut authenticated_id = None;

    while {
        let mut server_out = Cursor::new(Vec::new());
        let state = if server_session.are_we_first() {
            server_session.step(None, &mut server_out)
        } else {
            let input = input_rx
                .blocking_recv()
                .ok_or(anyhow!("Failed to receive SASL input"))?;
            server_session.step(Some(input.as_slice()), &mut server_out)
        };
        let running = state.as_ref().is_ok_and(|s| s.is_running());

        let output = match state {
            Ok(State::Running) => MechanismNegotiatorResult::Challenge(server_out.into_inner()),
            Ok(State::Finished(message_sent)) => {
                let additional_data = match message_sent {
                    MessageSent::Yes => Some(server_out.into_inner()),
                    MessageSent::No => None,
                };

                // `validation()` only ever yields a value once the session
                // has finished stepping, which is exactly this arm; it is
                // called nowhere else so the id can be cached here and
                // reused as this function's own return value below.
                let id = server_session
                    .validation()
                    .map(|validation| {
                        validation.map_err(|err| anyhow!("Authentication failed: {:?}", err))
                    })
                    .unwrap_or(Err(anyhow!("Could not complete authentication")));

                match id {
                    Ok(id) => {
                        let jid = Jid::new(Some(id.clone()), resolved_domain.clone(), None);
                        authenticated_id = Some(id);
                        MechanismNegotiatorResult::Success(jid, additional_data)
                    }
                    Err(err) => MechanismNegotiatorResult::Failure(err),
                }
            }
            Err(err) => MechanismNegotiatorResult::Failure(anyhow!(err)),
        };

        output_tx
            .blocking_send(output)
            .map_err(|_| anyhow!("Failed to send SASL output"))?;

        running
    } {}

    authenticated_id.ok_or_else(|| anyhow!("Could not complete authentication"))
}
