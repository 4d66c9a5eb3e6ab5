//! Local docker build backend

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::dispatcher::{is_transient_failure, BuildBackend, BuildReport, BuildRequest, BuildStart};
use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::models::deployment::Framework;
use crate::storage::artifacts::ArtifactStore;

/// Dockerfile used when the template directory has none
const DEFAULT_DOCKERFILE: &str = r#"FROM public.ecr.aws/lambda/python:3.11
COPY requirements.txt ${LAMBDA_TASK_ROOT}/
RUN pip install --no-cache-dir -r ${LAMBDA_TASK_ROOT}/requirements.txt
ARG MODEL_FILE
ARG FRAMEWORK
ENV MODEL_FILE=${MODEL_FILE} FRAMEWORK=${FRAMEWORK}
COPY ${MODEL_FILE} ${LAMBDA_TASK_ROOT}/
COPY wrapper.py ${LAMBDA_TASK_ROOT}/
CMD ["wrapper.handler"]
"#;

/// Serving handler used when the template directory has none
const DEFAULT_WRAPPER: &str = r#"import json, os, pickle

_model = None

def _load():
    global _model
    if _model is None:
        with open(os.path.join(os.environ["LAMBDA_TASK_ROOT"], os.environ["MODEL_FILE"]), "rb") as f:
            _model = pickle.load(f)
    return _model

def handler(event, context):
    body = json.loads(event.get("body") or "{}") if isinstance(event.get("body"), str) else event
    prediction = _load().predict([body["data"]])
    return {"statusCode": 200, "body": json.dumps({"prediction": list(map(float, prediction))})}
"#;

/// Runs `docker build` and `docker push` on this host
pub struct DockerBuildBackend {
    docker_bin: String,
    template_dir: Dir,
    builds_dir: Dir,
    artifacts: Arc<dyn ArtifactStore>,
    push: bool,
}

impl DockerBuildBackend {
    pub fn new(
        docker_bin: impl Into<String>,
        template_dir: Dir,
        builds_dir: Dir,
        artifacts: Arc<dyn ArtifactStore>,
        push: bool,
    ) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            template_dir,
            builds_dir,
            artifacts,
            push,
        }
    }

    async fn template(&self, name: &str, fallback: &str) -> Result<Vec<u8>, OrchestratorError> {
        let file = self.template_dir.file(name);
        if file.exists().await {
            file.read_bytes().await
        } else {
            Ok(fallback.as_bytes().to_vec())
        }
    }

    /// Write model, manifest and templates into a fresh build context
    async fn prepare_context(&self, request: &BuildRequest) -> Result<(Dir, String), OrchestratorError> {
        let artifact = self.artifacts.get(&request.artifact_ref).await?;
        let context = self
            .builds_dir
            .subdir(&format!("{}-a{}", request.deployment_id, request.attempt));
        context.delete().await?;
        context.create().await?;

        let model_file = artifact.meta.filename.clone();
        context.file(&model_file).write_atomic(&artifact.model).await?;

        let mut requirements = artifact.manifest.unwrap_or_default();
        if request.framework == Framework::Sklearn && !requirements.contains("scikit-learn") {
            requirements.push_str("\nscikit-learn\n");
        }
        context
            .file("requirements.txt")
            .write_atomic(requirements.as_bytes())
            .await?;
        context
            .file("Dockerfile")
            .write_atomic(&self.template("Dockerfile", DEFAULT_DOCKERFILE).await?)
            .await?;
        context
            .file("wrapper.py")
            .write_atomic(&self.template("wrapper.py", DEFAULT_WRAPPER).await?)
            .await?;

        Ok((context, model_file))
    }

    /// Run docker; `Ok(Err(stderr))` when the command ran and failed
    async fn docker(&self, args: &[&str]) -> Result<Result<(), String>, OrchestratorError> {
        debug!("{} {}", self.docker_bin, args.join(" "));
        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::Collaborator(format!("failed to run {}: {}", self.docker_bin, e))
            })?;

        if output.status.success() {
            Ok(Ok(()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            Ok(Err(tail.into_iter().rev().collect::<Vec<_>>().join("\n")))
        }
    }
}

#[async_trait]
impl BuildBackend for DockerBuildBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, request: &BuildRequest) -> Result<BuildStart, OrchestratorError> {
        let (context, model_file) = self.prepare_context(request).await?;
        let context_path = context.path().to_string_lossy().to_string();
        let model_arg = format!("MODEL_FILE={}", model_file);
        let framework_arg = format!("FRAMEWORK={}", request.framework);

        info!(deployment_id = %request.deployment_id, image_tag = %request.image_tag, "Building image");
        let built = self
            .docker(&[
                "build",
                "--build-arg",
                &model_arg,
                "--build-arg",
                &framework_arg,
                "-t",
                &request.image_tag,
                &context_path,
            ])
            .await?;

        let report = match built {
            Err(stderr) => BuildReport::Failure {
                transient: is_transient_failure(&stderr),
                error: format!("docker build failed: {}", stderr),
                log_ref: None,
            },
            Ok(()) if !self.push => BuildReport::Success {
                image_ref: request.image_tag.clone(),
                log_ref: None,
            },
            Ok(()) => match self.docker(&["push", &request.image_tag]).await? {
                Ok(()) => BuildReport::Success {
                    image_ref: request.image_tag.clone(),
                    log_ref: None,
                },
                Err(stderr) => BuildReport::Failure {
                    transient: is_transient_failure(&stderr),
                    error: format!("docker push failed: {}", stderr),
                    log_ref: None,
                },
            },
        };

        if let Err(e) = context.delete().await {
            debug!(error = %e, "Failed to remove build context");
        }
        Ok(BuildStart::Finished(report))
    }
}
