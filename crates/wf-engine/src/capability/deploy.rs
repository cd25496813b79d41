use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use wf_core::types::{new_service_id, CapabilityCategory, ServiceKind};
use wf_deploy::ServiceManager;
use wf_harness::provider::Tool;

use super::{str_arg, Capability, CapabilityError};

/// Deploy and stop services through the shared [`ServiceManager`]. The
/// manager outlives every invocation, so this capability is never torn down.
pub struct ServiceDeployCapability {
    manager: Arc<ServiceManager>,
}

impl ServiceDeployCapability {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }
}

fn title_case(kind: ServiceKind) -> String {
    let name = kind.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[async_trait]
impl Capability for ServiceDeployCapability {
    fn name(&self) -> &str {
        "service_deployer"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::ServiceDeploy
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "deploy_service",
                "Deploy a Streamlit, Gradio or Flask app and return its URL",
                json!({
                    "type": "object",
                    "properties": {
                        "app_type": {"type": "string", "enum": ["streamlit", "gradio", "flask"]},
                        "code": {"type": "string", "description": "Complete app source"},
                        "service_id": {"type": "string"}
                    },
                    "required": ["app_type", "code"]
                }),
            ),
            Tool::new(
                "stop_service",
                "Stop a deployed service",
                json!({
                    "type": "object",
                    "properties": {"service_id": {"type": "string"}},
                    "required": ["service_id"]
                }),
            ),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        match tool {
            "deploy_service" => {
                let kind: ServiceKind = str_arg(args, tool, "app_type")?
                    .parse()
                    .map_err(|e: wf_core::types::UnknownServiceKind| CapabilityError::InvalidArguments {
                        tool: tool.to_string(),
                        reason: e.to_string(),
                    })?;
                let code = str_arg(args, tool, "code")?;
                let service_id = args
                    .get("service_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| new_service_id(kind));

                let svc = self
                    .manager
                    .deploy(kind, code, &service_id)
                    .await
                    .map_err(|e| CapabilityError::Backend(e.to_string()))?;
                info!(service_id = %svc.service_id, url = %svc.url, "service deployed by unit");
                Ok(format!(
                    "✅ {} app deployed successfully!\n\nURL: {}\nService ID: {}\nPort: {}",
                    title_case(kind),
                    svc.url,
                    svc.service_id,
                    svc.port
                ))
            }
            "stop_service" => {
                let service_id = str_arg(args, tool, "service_id")?;
                if self.manager.stop(service_id).await {
                    Ok(format!("Service {service_id} stopped"))
                } else {
                    Err(CapabilityError::Backend(format!("service not found: {service_id}")))
                }
            }
            other => Err(CapabilityError::UnknownTool {
                capability: self.name().to_string(),
                tool: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wf_core::config::DeployConfig;

    fn capability() -> ServiceDeployCapability {
        let cfg = DeployConfig {
            upload_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            port_start: 47600,
            port_end: 47601,
            ..DeployConfig::default()
        };
        ServiceDeployCapability::new(Arc::new(ServiceManager::new(cfg)))
    }

    #[test]
    fn kind_titles() {
        assert_eq!(title_case(ServiceKind::Streamlit), "Streamlit");
        assert_eq!(title_case(ServiceKind::Flask), "Flask");
    }

    #[tokio::test]
    async fn argument_errors() {
        let cap = capability();
        let err = cap
            .call("deploy_service", &json!({"app_type": "django", "code": "x"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown service kind: django"));

        let err = cap
            .call("stop_service", &json!({"service_id": "st_missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "service not found: st_missing");

        let err = cap
            .call(
                "deploy_service",
                &json!({"app_type": "streamlit", "code": "x", "service_id": "x/../../escaped"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid service id"));

        assert_eq!(cap.category(), CapabilityCategory::ServiceDeploy);
    }
}
