//! C5 — Remote Scheduler Client: ships a reminder to a server for
//! server-side delivery (spec §6), used by the Critical Mirror as a backup
//! channel for when the device itself is unreachable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePriority {
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleNotificationRequest {
    pub user_id: String,
    pub push_token: String,
    pub title: String,
    pub body: String,
    pub data: ScheduleNotificationData,
    pub scheduled_time: i64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleNotificationData {
    #[serde(rename = "type")]
    pub kind: String,
    pub pet_id: String,
    pub entity_id: String,
    pub priority: RemotePriority,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleNotificationResponse {
    pub success: bool,
    pub notification_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendImmediateNotificationRequest {
    pub push_token: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendImmediateNotificationResponse {
    pub success: bool,
    pub ticket_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelNotificationResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetNotificationStatsResponse {
    pub success: bool,
    pub stats: NotificationStats,
}

#[async_trait]
pub trait RemoteSchedulerClient: Send + Sync {
    async fn schedule_notification(
        &self,
        req: ScheduleNotificationRequest,
    ) -> AppResult<ScheduleNotificationResponse>;

    async fn send_immediate_notification(
        &self,
        req: SendImmediateNotificationRequest,
    ) -> AppResult<SendImmediateNotificationResponse>;

    async fn cancel_notification(&self, notification_id: &str) -> AppResult<CancelNotificationResponse>;

    async fn get_notification_stats(&self, user_id: &str) -> AppResult<GetNotificationStatsResponse>;
}

/// `reqwest`-backed client over the four endpoints in spec §6. Every call
/// imposes the configured timeout (default 10s, per spec §5 "Network calls
/// in C5 must impose a timeout").
pub struct HttpRemoteSchedulerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteSchedulerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AppError::Request)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RemoteSchedulerClient for HttpRemoteSchedulerClient {
    async fn schedule_notification(
        &self,
        req: ScheduleNotificationRequest,
    ) -> AppResult<ScheduleNotificationResponse> {
        let url = format!("{}/scheduleNotification", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(AppError::Request)?;
        if !resp.status().is_success() {
            return Err(AppError::RemoteScheduler(format!(
                "scheduleNotification returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::RemoteScheduler(e.to_string()))
    }

    async fn send_immediate_notification(
        &self,
        req: SendImmediateNotificationRequest,
    ) -> AppResult<SendImmediateNotificationResponse> {
        let url = format!("{}/sendImmediateNotification", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(AppError::Request)?;
        if !resp.status().is_success() {
            return Err(AppError::RemoteScheduler(format!(
                "sendImmediateNotification returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::RemoteScheduler(e.to_string()))
    }

    async fn cancel_notification(&self, notification_id: &str) -> AppResult<CancelNotificationResponse> {
        let url = format!("{}/cancelNotification", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "notificationId": notification_id }))
            .send()
            .await
            .map_err(AppError::Request)?;
        if !resp.status().is_success() {
            return Err(AppError::RemoteScheduler(format!(
                "cancelNotification returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::RemoteScheduler(e.to_string()))
    }

    async fn get_notification_stats(&self, user_id: &str) -> AppResult<GetNotificationStatsResponse> {
        let url = format!("{}/getNotificationStats", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("userId", user_id)])
            .send()
            .await
            .map_err(AppError::Request)?;
        if !resp.status().is_success() {
            return Err(AppError::RemoteScheduler(format!(
                "getNotificationStats returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::RemoteScheduler(e.to_string()))
    }
}
