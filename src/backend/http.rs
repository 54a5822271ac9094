use super::{
    classify_response, Backend, ColumnsReply, CustomFeatureBody, CustomFeatureReply,
    ExplorationCall, ExplorationReply, InterpretabilityReply, MessageReply, TrainModelBody,
    TrainModelReply, TreatmentBody, UploadPayload,
};
use crate::error::BackendError;
use crate::model::{InterpretabilityKind, SessionConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

/// reqwest-backed client for the analysis service.
#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(cfg: &SessionConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.connect_timeout)
            .build()
            .context("build http client")?;
        let mut base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid backend url {}", cfg.base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(BackendError::transport)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let url = self.url(path)?;
        debug!(%url, "GET");
        let resp = self.http.get(url).send().await.map_err(BackendError::transport)?;
        read_json(resp).await
    }

    async fn post_json<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let url = self.url(path)?;
        debug!(%url, "POST");
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(BackendError::transport)?;
        read_json(resp).await
    }
}

async fn read_body(resp: Response) -> Result<Bytes, BackendError> {
    let status = resp.status().as_u16();
    let body = resp.bytes().await.map_err(BackendError::transport)?;
    classify_response(status, &body)?;
    Ok(body)
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    let body = read_body(resp).await?;
    serde_json::from_slice(&body).map_err(BackendError::decode)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn upload(&self, payload: &UploadPayload) -> Result<(), BackendError> {
        let part = reqwest::multipart::Part::bytes(payload.bytes.to_vec())
            .file_name(payload.file_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = self.url("upload")?;
        debug!(%url, file = %payload.file_name, bytes = payload.bytes.len(), "POST multipart");
        let resp = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(BackendError::transport)?;
        read_body(resp).await.map(|_| ())
    }

    async fn upload_context(&self, files: &[UploadPayload]) -> Result<(), BackendError> {
        let form = files.iter().fold(reqwest::multipart::Form::new(), |form, file| {
            let part = reqwest::multipart::Part::bytes(file.bytes.to_vec()).file_name(file.file_name.clone());
            form.part("files", part)
        });
        let url = self.url("upload-context")?;
        debug!(%url, files = files.len(), "POST multipart");
        let resp = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(BackendError::transport)?;
        read_body(resp).await.map(|_| ())
    }

    async fn get_columns(&self) -> Result<Vec<String>, BackendError> {
        let reply: ColumnsReply = self.get_json("get_columns").await?;
        Ok(reply.columns)
    }

    async fn get_augmented_columns(&self) -> Result<Vec<String>, BackendError> {
        let reply: ColumnsReply = self.get_json("get_augmented_df_columns").await?;
        Ok(reply.columns)
    }

    async fn apply_treatment(&self, body: &TreatmentBody) -> Result<String, BackendError> {
        let reply: MessageReply = self.post_json("apply_treatment", body).await?;
        Ok(reply.message)
    }

    async fn custom_feature(
        &self,
        body: &CustomFeatureBody,
    ) -> Result<CustomFeatureReply, BackendError> {
        self.post_json("eda/custom_feature", body).await
    }

    async fn train_model(&self, body: &TrainModelBody) -> Result<TrainModelReply, BackendError> {
        self.post_json("train_model", body).await
    }

    async fn interpretability(
        &self,
        kind: InterpretabilityKind,
    ) -> Result<InterpretabilityReply, BackendError> {
        self.get_json(kind.endpoint()).await
    }

    async fn explore(&self, call: &ExplorationCall) -> Result<ExplorationReply, BackendError> {
        let mut url = self.url(call.path)?;
        if !call.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &call.query {
                pairs.append_pair(k, v);
            }
        }
        debug!(%url, "POST");
        let resp = self
            .http
            .post(url)
            .json(&call.body)
            .send()
            .await
            .map_err(BackendError::transport)?;
        read_json(resp).await
    }

    async fn download(&self) -> Result<Bytes, BackendError> {
        let url = self.url("download")?;
        debug!(%url, "GET");
        let resp = self.http.get(url).send().await.map_err(BackendError::transport)?;
        read_body(resp).await
    }
}
