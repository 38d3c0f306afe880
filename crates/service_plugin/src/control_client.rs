use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CallError;
use crate::message::*;
use crate::worker::WorkerHandle;

/// Typed calls against one service worker.
#[derive(Clone, Debug)]
pub struct ServiceClient {
    worker: Arc<WorkerHandle>,
    timeout: Duration,
}

impl ServiceClient {
    pub fn new(worker: Arc<WorkerHandle>, timeout: Duration) -> Self {
        Self { worker, timeout }
    }

    pub fn service_id(&self) -> &str {
        self.worker.service_id()
    }

    /// Call any command and deserialize the reply body into `R`.
    pub async fn call<R: DeserializeOwned>(&self, command: ServiceCommand) -> Result<R, CallError> {
        let body = self
            .worker
            .call(command.method(), command.payload()?, self.timeout)
            .await?;
        serde_json::from_value(body).map_err(|e| CallError::Codec(e.to_string()))
    }

    pub async fn open(&self, options: OpenOptions) -> Result<ServiceInfo, CallError> {
        self.call(ServiceCommand::Open(options)).await
    }

    pub async fn query_info(&self) -> Result<ServiceInfo, CallError> {
        self.call(ServiceCommand::QueryInfo).await
    }

    pub async fn query_users(&self) -> Result<UserDirectory, CallError> {
        self.call(ServiceCommand::QueryUsers).await
    }

    pub async fn send_message(&self, params: SendMessageParams) -> Result<(), CallError> {
        let _: Value = self.call(ServiceCommand::SendMessage(params)).await?;
        Ok(())
    }

    pub async fn start_listen(&self, request: ListenRequest) -> Result<ListenStarted, CallError> {
        self.call(ServiceCommand::StartListen(request)).await
    }

    pub async fn stop_listen(&self, request: StopListen) -> Result<StopListen, CallError> {
        self.call(ServiceCommand::StopListen(request)).await
    }

    pub async fn callbacks(&self) -> Result<Vec<CallbackRecord>, CallError> {
        self.call(ServiceCommand::GetCallbacks).await
    }

    pub async fn post_callback(&self, event: CallbackEvent) -> Result<(), CallError> {
        let _: Value = self.call(ServiceCommand::PostCallback(event)).await?;
        Ok(())
    }
}
