use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::request::{
    BoxFuture, CommandProcessor, DefaultRequest, PayloadKind, ProcessorProvider, RequestKind,
};
use crate::router::{
    Common, CommandsVerification, Response, ServiceLoader, HEARTBEAT, INTERNAL_ERROR, MONITOR,
    NOT_FOUND, UNAUTHORIZED,
};
use crate::{AppError, AppResult};

pub type ServiceFuture<'a> = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>>;

/// Business logic bound to one command.
///
/// An `Err` is answered with a 500 error and the connection is closed.
pub trait Service: Send + Sync {
    fn do_job<'a>(
        &'a self,
        request: &'a DefaultRequest,
        response: &'a Response,
        common: &'a Common,
    ) -> ServiceFuture<'a>;
}

type OfflineHook = Arc<dyn Fn(u32) + Send + Sync>;

/// The JSON command pipeline: verify, answer reserved commands, then run the
/// registered service.
#[derive(Clone)]
pub struct CommandRouter {
    verification: Arc<CommandsVerification>,
    services: Arc<ServiceLoader<dyn Service>>,
    common: Arc<Common>,
    on_offline: Option<OfflineHook>,
}

impl CommandRouter {
    pub fn new(
        verification: Arc<CommandsVerification>,
        services: Arc<ServiceLoader<dyn Service>>,
        common: Arc<Common>,
    ) -> Self {
        CommandRouter {
            verification,
            services,
            common,
            on_offline: None,
        }
    }

    /// Called with the index of every connection that goes offline.
    pub fn with_offline<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_offline = Some(Arc::new(hook));
        self
    }

    pub fn common(&self) -> &Arc<Common> {
        &self.common
    }

    pub async fn route(&self, request: DefaultRequest) {
        let response = Response::new(request.request().sender().clone());
        let _in_flight = self.common.begin_request();
        trace!(
            "connection {} command {:?} received at {}",
            request.index(),
            request.command(),
            request.received_at()
        );

        match self
            .verification
            .is_valid_auth(request.command(), request.authorization())
        {
            Ok(true) => {}
            Ok(false) => {
                response.send_error_close(
                    request.text(),
                    UNAUTHORIZED,
                    Some("authorization failed"),
                );
                return;
            }
            Err(e) => {
                response.send_error_close(request.text(), NOT_FOUND, Some(&e.to_string()));
                return;
            }
        }

        // verified, so the command is present
        let Some(command) = request.command() else {
            return;
        };
        match command {
            HEARTBEAT => self.common.send_pong(&request, &response),
            MONITOR => self.common.send_monitor(&response),
            command => match self.services.get_service(command) {
                Ok(service) => {
                    if let Err(e) = service.do_job(&request, &response, &self.common).await {
                        response.send_error_close(
                            request.text(),
                            INTERNAL_ERROR,
                            Some(&e.to_string()),
                        );
                    }
                }
                Err(e @ AppError::CommandNotFound(_)) => {
                    response.send_error_close(request.text(), NOT_FOUND, Some(&e.to_string()));
                }
                Err(e) => {
                    response.send_error_close(request.text(), INTERNAL_ERROR, Some(&e.to_string()));
                }
            },
        }
    }
}

impl CommandProcessor for CommandRouter {
    fn handle(&self, request: RequestKind) -> BoxFuture<'_> {
        Box::pin(async move {
            match request {
                RequestKind::Json(request) => self.route(request).await,
                other => warn!(
                    "command router only takes JSON requests, dropping one from connection {}",
                    other.index()
                ),
            }
        })
    }
}

impl ProcessorProvider for CommandRouter {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Json
    }

    fn create_processor(&self) -> Arc<dyn CommandProcessor> {
        Arc::new(self.clone())
    }

    fn offline(&self, index: u32) {
        debug!("connection {index} offline");
        if let Some(hook) = &self.on_offline {
            hook(index);
        }
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("services", &self.services)
            .field("common", &self.common)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::network::{ConnectionRegistry, MessageSender, SendExecutor};
    use crate::request::{text_request, RecordingSender};
    use crate::router::{AccessToken, CommandAuthorization, CommandsDefinition, AUTHORIZATION_F5};
    use crate::service::{GeneralConfig, NetworkConfig};

    struct Echo;

    impl Service for Echo {
        fn do_job<'a>(
            &'a self,
            request: &'a DefaultRequest,
            response: &'a Response,
            _common: &'a Common,
        ) -> ServiceFuture<'a> {
            Box::pin(async move {
                response.send(request.text());
                Ok(())
            })
        }
    }

    struct Broken;

    impl Service for Broken {
        fn do_job<'a>(
            &'a self,
            _request: &'a DefaultRequest,
            _response: &'a Response,
            _common: &'a Common,
        ) -> ServiceFuture<'a> {
            Box::pin(async { Err(AppError::IllegalStateError("boom".into())) })
        }
    }

    fn router() -> CommandRouter {
        let verification = CommandsVerification::new();
        verification.load_definition(CommandsDefinition {
            access_tokens: vec![AccessToken {
                access_token: "aabbcc".into(),
                department: "ops".into(),
            }],
            commands_authorization: ["/v1/server/echo", "/v1/broken", "/v1/unbound"]
                .into_iter()
                .map(|command| CommandAuthorization {
                    command: command.into(),
                    department: vec!["ops".into()],
                })
                .collect(),
        });

        let services: ServiceLoader<dyn Service> = ServiceLoader::new();
        services
            .register("/v1/server/echo", true, || Arc::new(Echo) as Arc<dyn Service>)
            .unwrap();
        services
            .register("/v1/broken", false, || Arc::new(Broken) as Arc<dyn Service>)
            .unwrap();

        let executor = Arc::new(SendExecutor::new());
        let sender = MessageSender::new(Arc::new(ConnectionRegistry::new()), executor);
        let common = Common::new(&GeneralConfig::default(), &NetworkConfig::default(), sender);
        CommandRouter::new(Arc::new(verification), Arc::new(services), Arc::new(common))
    }

    async fn route(router: &CommandRouter, text: &str) -> Vec<(String, bool)> {
        let (request, sender): (_, Arc<RecordingSender>) = text_request(text);
        let request = DefaultRequest::parse(request).unwrap();
        router.handle(RequestKind::Json(request)).await;
        let sent = sender.sent.lock().clone();
        sent
    }

    fn code_of(sent: &[(String, bool)]) -> i64 {
        let body: Value = serde_json::from_str(&sent[0].0).unwrap();
        body["code"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_echo_returns_input() {
        let router = router();
        let text = r#"{"command":"/v1/server/echo","authorization":"aabbcc"}"#;
        let sent = route(&router, text).await;
        assert_eq!(sent, vec![(text.to_string(), false)]);
        assert_eq!(router.common().request_count(), 0);
    }

    #[tokio::test]
    async fn test_rejections_close_with_codes() {
        let router = router();

        let sent = route(&router, r#"{"authorization":"aabbcc"}"#).await;
        assert_eq!(code_of(&sent), 404);
        assert!(sent[0].1);

        let sent = route(&router, r#"{"command":"/v1/nope","authorization":"aabbcc"}"#).await;
        assert_eq!(code_of(&sent), 404);

        let sent = route(&router, r#"{"command":"/v1/server/echo","authorization":"x"}"#).await;
        assert_eq!(code_of(&sent), 401);
        assert!(sent[0].1);

        // authorized, but no service registered
        let sent = route(&router, r#"{"command":"/v1/unbound","authorization":"aabbcc"}"#).await;
        assert_eq!(code_of(&sent), 404);

        let sent = route(&router, r#"{"command":"/v1/broken","authorization":"aabbcc"}"#).await;
        assert_eq!(code_of(&sent), 500);
        assert!(sent[0].1);
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered_by_common() {
        let router = router();
        let text = json!({"command": HEARTBEAT, "authorization": AUTHORIZATION_F5}).to_string();
        let sent = route(&router, &text).await;
        assert_eq!(sent, vec![(r#"{"data":"pong"}"#.to_string(), true)]);
    }

    #[tokio::test]
    async fn test_offline_hook_is_called() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let router = router().with_offline(move |index| hook_seen.lock().push(index));
        router.offline(3);
        assert_eq!(*seen.lock(), vec![3]);
        assert_eq!(router.payload_kind(), PayloadKind::Json);
    }
}
