use clap::{Parser, Subcommand};

use confidante_backend::settings::Settings;
use confidante_backend::store::{SqliteStoreBackend, StoreHandle};
use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use confidante_core::xmpp::jid::Jid;
use confidante_inbound::connection::debug::DebugConnection;
use confidante_inbound::connection::tcp::TcpConnection;
use confidante_inbound::{ConnectionType, InboundStreamSettings};
use confidante_inbound::{
    InboundStream,
    sasl::{StoredPassword, StoredPasswordArgon2, StoredPasswordScram},
};
use confidante_services::iq::disco_info::DiscoInfo;
use confidante_services::iq::disco_items::DiscoItems;
use confidante_services::registry::ModuleRegistry;
use confidante_services::router::RouterHandle;
use sha1::Sha1;
use sha2::Sha256;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    AddUser { bare_jid: String, password: String },
    RemoveUser { bare_jid: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().init();

    let settings = Settings::init()?;

    let store_backend = SqliteStoreBackend::new(&settings).await?;
    let store = StoreHandle::new(store_backend);

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::AddUser { bare_jid, password }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            let stored_password_argon2 = StoredPasswordArgon2::new(&password)?.to_string();
            let stored_password_scram_sha1 =
                StoredPasswordScram::<Sha1>::new(&password)?.to_string();
            let stored_password_scram_sha256 =
                StoredPasswordScram::<Sha256>::new(&password)?.to_string();
            store
                .add_user(
                    bare_jid,
                    stored_password_argon2,
                    stored_password_scram_sha1,
                    stored_password_scram_sha256,
                )
                .await?;
        }
        Some(Commands::RemoveUser { bare_jid }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            store.remove_user(bare_jid).await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:5222").await?;

            let router = RouterHandle::new();

            let disco_info = DiscoInfo::new();
            let disco_items = DiscoItems::default();
            confidante_services::core::register(&router, (&settings.domain).into()).await?;
            confidante_services::iq::register_builtin_handlers(
                &router,
                disco_info.clone(),
                disco_items.clone(),
            )
            .await?;
            if let Some(muc_subdomain) = &settings.muc_subdomain {
                let muc_domain = format!("{muc_subdomain}.{}", settings.domain);
                confidante_services::muc::register(&router, muc_domain, &disco_info, &disco_items)
                    .await?;
            }

            let mut module_registry = ModuleRegistry::new(router.clone(), tokio::runtime::Handle::current());
            for (name, config) in &settings.modules {
                let Some(path) = config.get("path") else {
                    tracing::warn!(module = %name, "module has no \"path\" key, skipping");
                    continue;
                };
                // SAFETY: the operator-supplied path is trusted the same way the
                // rest of the server's configuration is; loading it runs its
                // `module_new` immediately.
                if let Err(error) = unsafe { module_registry.load(name, std::path::Path::new(path)) } {
                    tracing::error!(module = %name, %error, "failed to load module");
                    return Err(error.into());
                }
                for (key, value) in config {
                    if key == "path" {
                        continue;
                    }
                    if let Err(error) = module_registry.configure(name, key, value) {
                        tracing::error!(module = %name, key, %error, "module rejected configuration");
                    }
                }
            }
            module_registry.start_all()?;

            loop {
                let (connection, _) = listener.accept().await?;

                let settings = settings.clone();
                let router = router.clone();
                let store = store.clone();

                let record_streams = settings.debug.record_streams;

                tokio::spawn(async move {
                    let connection =
                        TcpConnection::new(connection, settings.tls.server_config.clone(), true);
                    let inbound_settings = InboundStreamSettings {
                        connection_type: ConnectionType::Client,
                        domain: settings.domain.clone(),
                        tls_required: settings.tls.required_for_clients,
                    };

                    if record_streams {
                        let connection = match DebugConnection::try_new(connection).await {
                            Ok(connection) => connection,
                            Err(error) => {
                                tracing::error!(%error, "failed to set up connection recorder");
                                return;
                            }
                        };
                        tracing::info!(uuid = %connection.uuid(), "new connection");
                        let mut stream = InboundStream::<_, RustyXmlStreamParser<_>, _>::new(
                            connection,
                            router,
                            store,
                            inbound_settings,
                        );
                        stream.handle().await;
                    } else {
                        let mut stream = InboundStream::<_, RustyXmlStreamParser<_>, _>::new(
                            connection,
                            router,
                            store,
                            inbound_settings,
                        );
                        stream.handle().await;
                    }
                });
            }
        }
    }

    Ok(())
}
