use crate::amqp::configuration::{RabbitMqSettings, RabbitMqTlsSettings};
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::{sync::Arc, time::Duration};

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to a RabbitMq broker.
///
/// It is the `deadpool` manager behind [`ConnectionPool`](crate::pool::ConnectionPool): every
/// connection the pool hands out was opened here.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_name: Option<String>,
    connection_timeout: Duration,
    /// `None` for plain-text connections.
    tls: Option<Arc<Tls>>,
}

/// Errors encountered while opening a connection.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("Timed out after {0:?} while trying to connect to RabbitMq")]
    Timeout(Duration),
    #[error("Failed to connect to RabbitMq")]
    Broker(#[from] lapin::Error),
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl Tls {
    fn new(settings: &RabbitMqTlsSettings, host: &str) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = settings.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        Ok(Self {
            connector: builder.build()?,
            domain_name: settings.domain.clone().unwrap_or_else(|| host.to_owned()),
        })
    }
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// It fails if the TLS configuration is invalid (e.g. the CA chain cannot be parsed).
    /// If the connection timeout is left unspecified, it defaults to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let uri = settings.amqp_uri();
        let tls = settings
            .tls
            .as_ref()
            .map(|tls| Tls::new(tls, &uri.authority.host).map(Arc::new))
            .transpose()?;
        Ok(Self {
            uri,
            connection_name: settings.connection_name.clone(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls,
        })
    }

    /// Open a new connection, encrypted if TLS was configured.
    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self),
        fields(host = %self.uri.authority.host, tls = self.tls.is_some())
    )]
    pub async fn new_connection(&self) -> Result<lapin::Connection, ConnectError> {
        let connect = async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), self.properties()).await,
                Some(tls) => self.connect_with_tls(Arc::clone(tls)).await,
            }
        };
        let connection = tokio::time::timeout(self.connection_timeout, connect)
            .await
            .map_err(|_| ConnectError::Timeout(self.connection_timeout))??;

        // Channels opened on the connection get notified too: this is only for the logs.
        connection.on_error(|e| {
            tracing::warn!(error = ?e, "RabbitMq connection broken");
        });
        Ok(connection)
    }

    fn properties(&self) -> ConnectionProperties {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }

    async fn connect_with_tls(&self, tls: Arc<Tls>) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain AMQP over TCP first, then the TLS handshake on top of the socket.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
            }),
            self.properties(),
        )
        .await
    }
}
