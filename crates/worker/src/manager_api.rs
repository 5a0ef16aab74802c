//! HTTP client for the manager's control surface.

use std::time::Duration;

use reqwest::{StatusCode, Url};

use ctsieve_core::api::{
    AcquireRequest, AcquireResponse, CompleteRequest, ErrorReport, HeartbeatRequest, JobGrant,
    ResumeRequest, UploadRecord, UploadResponse,
};

/// Manager responses the fetch loop branches on; everything else is
/// carried as context on the anyhow chain.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("assignment is no longer owned by this worker")]
    NotOwner,
}

pub struct ManagerClient {
    control: reqwest::Client,
    upload: reqwest::Client,
    base: Url,
    worker_name: String,
}

impl ManagerClient {
    pub fn new(
        base: Url,
        worker_name: String,
        control_timeout: Duration,
        upload_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut base = base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let control = reqwest::Client::builder().timeout(control_timeout).build()?;
        let upload = reqwest::Client::builder().timeout(upload_timeout).build()?;
        Ok(Self {
            control,
            upload,
            base,
            worker_name,
        })
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path)
            .map_err(|err| anyhow::anyhow!("invalid manager url {}: {err}", self.base))
    }

    pub async fn health(&self) -> anyhow::Result<()> {
        let res = self.control.get(self.endpoint("api/health")?).send().await?;
        check(res).await?;
        Ok(())
    }

    pub async fn acquire(&self, category: &str) -> anyhow::Result<Option<JobGrant>> {
        let res = self
            .control
            .post(self.endpoint("api/worker/acquire")?)
            .json(&AcquireRequest {
                worker_name: self.worker_name.clone(),
                category: category.to_string(),
            })
            .send()
            .await?;
        let res = check(res).await?;
        Ok(res.json::<AcquireResponse>().await?.into_grant())
    }

    pub async fn heartbeat(&self, log_name: &str, start: u64, current: u64) -> anyhow::Result<()> {
        let res = self
            .control
            .post(self.endpoint("api/worker/heartbeat")?)
            .json(&HeartbeatRequest {
                worker_name: self.worker_name.clone(),
                log_name: log_name.to_string(),
                start,
                current,
            })
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    pub async fn upload(&self, batch: &[UploadRecord]) -> anyhow::Result<UploadResponse> {
        let res = self
            .upload
            .post(self.endpoint("api/worker/upload")?)
            .json(&batch)
            .send()
            .await?;
        let res = check(res).await?;
        Ok(res.json().await?)
    }

    pub async fn complete(&self, log_name: &str, start: u64) -> anyhow::Result<()> {
        let res = self
            .control
            .post(self.endpoint("api/worker/complete")?)
            .json(&CompleteRequest {
                worker_name: self.worker_name.clone(),
                log_name: log_name.to_string(),
                start,
            })
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    pub async fn resume(&self, log_name: &str, start: u64, current: u64) -> anyhow::Result<()> {
        let res = self
            .control
            .post(self.endpoint("api/worker/resume")?)
            .json(&ResumeRequest {
                worker_name: self.worker_name.clone(),
                log_name: log_name.to_string(),
                start,
                current,
            })
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    pub async fn report_error(
        &self,
        log_name: &str,
        start: u64,
        message: &str,
    ) -> anyhow::Result<()> {
        let res = self
            .control
            .post(self.endpoint("api/worker/error")?)
            .json(&ErrorReport {
                worker_name: self.worker_name.clone(),
                log_name: log_name.to_string(),
                start,
                message: message.to_string(),
            })
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }
}

async fn check(res: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
        return Err(ManagerError::NotOwner.into());
    }
    anyhow::bail!("manager returned http {status}: {body}")
}
