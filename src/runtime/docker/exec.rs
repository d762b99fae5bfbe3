//! Command execution inside running containers

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures_util::StreamExt;

use crate::runtime::traits::{ExecOutput, RuntimeError, RuntimeResult};

use super::{map_docker_err, DockerRuntime};

pub(crate) async fn run_exec(
    runtime: &DockerRuntime,
    id: &str,
    cmd: Vec<String>,
) -> RuntimeResult<ExecOutput> {
    let options = CreateExecOptions {
        cmd: Some(cmd),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };

    let exec = runtime
        .client()
        .create_exec(id, options)
        .await
        .map_err(|e| map_docker_err(id, e))?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    match runtime
        .client()
        .start_exec(&exec.id, None)
        .await
        .map_err(RuntimeError::Docker)?
    {
        StartExecResults::Attached { mut output, .. } => {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(RuntimeError::Docker(e)),
                }
            }
        }
        StartExecResults::Detached => {
            return Err(RuntimeError::ExecFailed(
                "exec unexpectedly detached".to_string(),
            ));
        }
    }

    let inspect = runtime
        .client()
        .inspect_exec(&exec.id)
        .await
        .map_err(RuntimeError::Docker)?;

    Ok(ExecOutput {
        exit_code: inspect.exit_code.unwrap_or(-1),
        stdout,
        stderr,
    })
}
