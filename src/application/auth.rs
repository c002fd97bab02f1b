//! GitHub device authorisation as a cancellable background task.

use anyhow::Result;
use log::info;

use crate::config::GlobalConfig;
use crate::resolver::{DeviceCode, GitHubDeviceAuth};
use crate::archive::ArchiveExtractor;
use crate::runtime::Runtime;
use crate::tasks::TaskResult;

use super::Manager;

/// Key of the device-flow polling task.
pub const GITHUB_AUTH_TASK: &str = "github-auth";

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    /// Requests a device code and polls for approval in the background. The
    /// token is stored in the global config once GitHub hands it out.
    ///
    /// Starting again replaces a flow that is still polling.
    pub async fn start_github_auth(
        &self,
        auth: GitHubDeviceAuth,
    ) -> Result<(DeviceCode, TaskResult<Result<()>>)> {
        let code = auth.request_device_code().await?;

        let runtime = self.runtime.clone();
        let locks = self.locks.clone();
        let config_dir = self.ctx.global.config_dir.clone();
        let polled = code.clone();
        let task = self.tasks.spawn(GITHUB_AUTH_TASK.to_string(), async move {
            let token = auth.poll_for_token(&polled).await?;
            GlobalConfig::update(&*runtime, &locks, Some(config_dir), |config| {
                config.access_tokens.github = Some(token);
            })
            .await?;
            info!("Stored GitHub access token");
            Ok(())
        });
        Ok((code, task))
    }

    /// Stops a polling device flow. Returns whether one was running.
    pub fn cancel_github_auth(&self) -> bool {
        self.tasks.cancel(&GITHUB_AUTH_TASK.to_string())
    }

    pub fn is_github_auth_running(&self) -> bool {
        self.tasks.is_running(&GITHUB_AUTH_TASK.to_string())
    }
}
