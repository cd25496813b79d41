//! Launch recipes per app framework.

use std::path::Path;

use wf_core::config::DeployConfig;
use wf_core::types::ServiceKind;
use wf_harness::sandbox::strip_fences;

/// File name the app source is written to inside its service directory.
pub const APP_FILE: &str = "app.py";

/// Program plus arguments used to start a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn to_command(&self, dir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).current_dir(dir);
        cmd
    }
}

/// Source with fences stripped and the port injected where the framework
/// takes it from code rather than the command line.
pub fn prepare_source(kind: ServiceKind, code: &str, port: u16) -> String {
    let code = strip_fences(code);
    match kind {
        ServiceKind::Streamlit => code,
        ServiceKind::Gradio => code.replace(
            ".launch()",
            &format!(".launch(server_port={port}, server_name=\"0.0.0.0\", share=False)"),
        ),
        ServiceKind::Flask => {
            if code.contains("app.run()") {
                code.replace("app.run()", &format!("app.run(host=\"0.0.0.0\", port={port})"))
            } else if !code.contains("if __name__") {
                format!(
                    "{code}\n\nif __name__ == \"__main__\":\n    app.run(host=\"0.0.0.0\", port={port})"
                )
            } else {
                code
            }
        }
    }
}

pub fn launch_command(kind: ServiceKind, cfg: &DeployConfig, port: u16) -> LaunchCommand {
    let port = port.to_string();
    match kind {
        ServiceKind::Streamlit => LaunchCommand {
            program: cfg.streamlit_bin.clone(),
            args: [
                "run",
                APP_FILE,
                "--server.port",
                port.as_str(),
                "--server.headless",
                "true",
                "--server.address",
                "0.0.0.0",
                "--browser.gatherUsageStats",
                "false",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        },
        ServiceKind::Gradio | ServiceKind::Flask => LaunchCommand {
            program: cfg.python.clone(),
            args: vec![APP_FILE.to_string()],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradio_launch_gets_port() {
        let src = "```python\nimport gradio as gr\ndemo = gr.Interface(fn=f, inputs='text', outputs='text')\ndemo.launch()\n```";
        let out = prepare_source(ServiceKind::Gradio, src, 8503);
        assert!(out.contains(".launch(server_port=8503, server_name=\"0.0.0.0\", share=False)"));
        assert!(!out.contains("```"));
    }

    #[test]
    fn flask_run_is_rewritten_or_appended() {
        let rewritten = prepare_source(ServiceKind::Flask, "app = Flask(__name__)\napp.run()", 8510);
        assert!(rewritten.ends_with("app.run(host=\"0.0.0.0\", port=8510)"));

        let appended = prepare_source(ServiceKind::Flask, "app = Flask(__name__)", 8511);
        assert!(appended.contains("if __name__ == \"__main__\":\n    app.run(host=\"0.0.0.0\", port=8511)"));

        let custom = "app = Flask(__name__)\nif __name__ == '__main__':\n    app.run(debug=True)";
        assert_eq!(prepare_source(ServiceKind::Flask, custom, 8512), custom);
    }

    #[test]
    fn streamlit_port_goes_on_command_line() {
        let cfg = DeployConfig::default();
        let cmd = launch_command(ServiceKind::Streamlit, &cfg, 8501);
        assert_eq!(cmd.program, "streamlit");
        assert_eq!(
            cmd.args.join(" "),
            "run app.py --server.port 8501 --server.headless true --server.address 0.0.0.0 --browser.gatherUsageStats false"
        );
        assert_eq!(prepare_source(ServiceKind::Streamlit, "import streamlit as st", 8501), "import streamlit as st");
    }

    #[test]
    fn python_frameworks_run_app_file() {
        let cfg = DeployConfig::default();
        let cmd = launch_command(ServiceKind::Flask, &cfg, 8600);
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["app.py".to_string()]);
    }
}
