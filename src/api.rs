use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: &'static str,
        source: reqwest::Error,
    },

    #[error("{endpoint} returned code {code}: {msg}")]
    Site {
        endpoint: &'static str,
        code: i64,
        msg: String,
    },

    #[error("unexpected response shape from {endpoint}: {detail}")]
    Shape {
        endpoint: &'static str,
        detail: String,
    },
}

/// Every site endpoint wraps its payload in this envelope; `code == 1`
/// signals success.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub token: String,
    pub useridentity: String,
    pub level: i64,
    pub task_num: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRow {
    pub id: u64,
    #[serde(default)]
    pub seconds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskListData {
    #[serde(rename = "taskNumArr", default)]
    pub task_num_arr: Vec<i64>,
    #[serde(default)]
    pub list: Vec<TaskRow>,
}

impl TaskListData {
    pub fn remaining(&self) -> i64 {
        self.task_num_arr.first().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderRow {
    pub task_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderListData {
    #[serde(default)]
    lists: Vec<OrderRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserInfoData {
    balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRecord {
    /// Record date in the site's `dd-mm-YYYY HH:MM` shape.
    pub date: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WithdrawLogData {
    #[serde(default)]
    list: Vec<WithdrawRecord>,
}

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36";

/// HTTP session against the site's form-POST API. Holds the bearer token
/// after login; cookies live for the process only.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    site_url: String,
    language: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, site_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ApiError::Transport {
                endpoint: "client",
                source,
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            site_url: site_url.trim_end_matches('/').to_string(),
            language: "fil_ph".to_string(),
            token: None,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<T, ApiError> {
        form.push(("language", self.language.clone()));
        if let Some(token) = &self.token {
            form.push(("token", token.clone()));
        }

        let url = format!("{}/{endpoint}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("origin", &self.site_url)
            .form(&form)
            .send()
            .await
            .map_err(|source| ApiError::Transport { endpoint, source })?;

        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|source| ApiError::Transport { endpoint, source })?;

        if envelope.code != 1 {
            return Err(ApiError::Site {
                endpoint,
                code: envelope.code,
                msg: envelope.msg,
            });
        }

        envelope.data.ok_or(ApiError::Shape {
            endpoint,
            detail: "missing data field".to_string(),
        })
    }

    /// Like [`post`], but for endpoints whose success payload is empty.
    async fn post_unit(
        &self,
        endpoint: &'static str,
        form: Vec<(&'static str, String)>,
    ) -> Result<(), ApiError> {
        match self.post::<serde_json::Value>(endpoint, form).await {
            Ok(_) => Ok(()),
            // code == 1 with a null data field still counts as success here
            Err(ApiError::Shape { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Logs in and stores the bearer token for subsequent calls.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<LoginData, ApiError> {
        let referer = format!("{}/#/login", self.site_url);
        let data: LoginData = self
            .post(
                "api/User/login",
                vec![
                    ("username", username.to_string()),
                    ("password", password.to_string()),
                    ("referer", referer),
                ],
            )
            .await?;
        self.token = Some(data.token.clone());
        Ok(data)
    }

    /// Fetches the first page of the task hall for the given tier.
    pub async fn task_list(&self, task_num: i64, level: i64) -> Result<TaskListData, ApiError> {
        let referer = format!("{}/#/taskList/{task_num}/{level}", self.site_url);
        self.post(
            "api/Task/getTaskList",
            vec![
                ("id", task_num.to_string()),
                ("task_level", level.to_string()),
                ("page_no", "1".to_string()),
                ("referer", referer),
            ],
        )
        .await
    }

    /// Claims a task so it can be watched and submitted.
    pub async fn receive_task(
        &self,
        task_id: u64,
        task_num: i64,
        level: i64,
    ) -> Result<(), ApiError> {
        let referer = format!("{}/#/taskList/{task_num}/{level}", self.site_url);
        self.post_unit(
            "api/Task/receiveTask",
            vec![("id", task_id.to_string()), ("referer", referer)],
        )
        .await
    }

    /// Reports the watched seconds and completes the task.
    pub async fn submit_task(&self, task_id: u64, seconds: u32) -> Result<(), ApiError> {
        let referer = format!("{}/#/task/video/{task_id}", self.site_url);
        self.post_unit(
            "api/Task/submitTask",
            vec![
                ("id", task_id.to_string()),
                ("seconds", seconds.to_string()),
                ("referer", referer),
            ],
        )
        .await
    }

    /// Lists tasks already claimed but not yet submitted.
    pub async fn in_progress_tasks(&self) -> Result<Vec<OrderRow>, ApiError> {
        let referer = format!("{}/#/myTask", self.site_url);
        let data: OrderListData = self
            .post(
                "api/Task/taskOrderList",
                vec![
                    ("status", "1".to_string()),
                    ("page_no", "1".to_string()),
                    ("referer", referer),
                ],
            )
            .await?;
        Ok(data.lists)
    }

    /// Reads the current personal balance.
    pub async fn balance(&self) -> Result<f64, ApiError> {
        let referer = format!("{}/#/user", self.site_url);
        let data: UserInfoData = self
            .post("api/User/getUserInfo", vec![("referer", referer)])
            .await?;
        Ok(data.balance)
    }

    /// Submits a withdrawal for the given amount.
    pub async fn withdraw(&self, amount: f64, fund_password: &str) -> Result<(), ApiError> {
        let referer = format!("{}/#/user/withdraw", self.site_url);
        self.post_unit(
            "api/User/withdraw",
            vec![
                ("amount", format!("{amount}")),
                ("paypassword", fund_password.to_string()),
                ("referer", referer),
            ],
        )
        .await
    }

    /// Fetches the withdrawal record list, newest first.
    pub async fn withdrawal_records(&self) -> Result<Vec<WithdrawRecord>, ApiError> {
        let referer = format!("{}/#/user/wallet", self.site_url);
        let data: WithdrawLogData = self
            .post(
                "api/User/withdrawLog",
                vec![("page_no", "1".to_string()), ("referer", referer)],
            )
            .await?;
        Ok(data.list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_with_payload_parses() {
        let raw = r#"{"code":1,"msg":"ok","data":{"token":"t","useridentity":"Internship","level":1,"task_num":5}}"#;
        let env: Envelope<LoginData> = serde_json::from_str(raw).unwrap();
        assert_eq!(env.code, 1);
        let data = env.data.unwrap();
        assert_eq!(data.useridentity, "Internship");
        assert_eq!(data.task_num, 5);
    }

    #[test]
    fn task_list_remaining_reads_first_counter() {
        let raw = r#"{"taskNumArr":[3,0],"list":[{"id":42,"seconds":11}]}"#;
        let data: TaskListData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.remaining(), 3);
        assert_eq!(data.list[0].id, 42);
    }

    #[test]
    fn empty_task_list_reports_zero_remaining() {
        let raw = r#"{"taskNumArr":[],"list":[]}"#;
        let data: TaskListData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.remaining(), 0);
        assert!(data.list.is_empty());
    }
}
