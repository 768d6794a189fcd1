/*!
 * Worker
 * Worker-process entry: receive one job over the channel, run it,
 * honor cancellation cooperatively
 */

use crate::dispatch::JobRequest;
use crate::ipc::{MessageType, WorkerConnection};
use crate::process::{ExecutionConfig, OutputLine, OutputStream, ProcessError, ProcessInvoker};
use log::{error, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long the worker waits for the host to deliver the job before
/// giving up and exiting.
const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the worker side of the channel. Returns the process exit code:
/// the job's own exit code on completion, 1 on failure or cancellation.
pub async fn run_worker(handle_out: &str, handle_in: &str) -> i32 {
    let first = tokio::time::timeout(JOB_WAIT_TIMEOUT, async {
        let mut conn = WorkerConnection::connect(handle_out, handle_in).await?;
        let frame = conn.recv().await?;
        Ok::<_, crate::ipc::ChannelError>((conn, frame))
    })
    .await;

    let (mut conn, frame) = match first {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            error!("Worker channel setup failed: {e}");
            return 1;
        }
        Err(_) => {
            error!("No job arrived within {JOB_WAIT_TIMEOUT:?}, exiting");
            return 1;
        }
    };

    let job = match frame {
        Some(msg) if msg.message_type == MessageType::NewJob => {
            match serde_json::from_str::<JobRequest>(&msg.body) {
                Ok(job) => job,
                Err(e) => {
                    error!("Malformed job payload: {e}");
                    return 1;
                }
            }
        }
        Some(msg) => {
            info!("Received {:?} before any job, exiting", msg.message_type);
            return 0;
        }
        None => {
            warn!("Host closed the channel before sending a job");
            return 1;
        }
    };

    info!("Worker received job {} ({})", job.job_id, job.display_name);
    let cancel = CancellationToken::new();

    // Control listener: any further frame (cancel, shutdown) and a host
    // that disappears (EOF) all stop the job.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                match conn.recv().await {
                    Ok(Some(msg)) => {
                        info!("Received {:?} frame, cancelling the job", msg.message_type);
                        cancel.cancel();
                        if msg.message_type == MessageType::Shutdown {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Host channel closed, cancelling the job");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => {
                        warn!("Channel receive failed: {e}");
                        cancel.cancel();
                        break;
                    }
                }
            }
        });
    }

    // Relay job output onto the worker's own stdio.
    let (output_tx, output_rx) = flume::unbounded::<OutputLine>();
    tokio::spawn(async move {
        while let Ok(line) = output_rx.recv_async().await {
            match line.stream {
                OutputStream::Stdout => println!("{}", line.line),
                OutputStream::Stderr => eprintln!("{}", line.line),
            }
        }
    });

    let mut config = ExecutionConfig::new(job.command)
        .with_args(job.args)
        .with_env(job.env.into_iter().collect())
        .with_output(output_tx);
    if let Some(dir) = job.working_dir {
        config = config.with_working_dir(dir);
    }

    let invoker = ProcessInvoker::new();
    match invoker.execute(config, cancel).await {
        Ok(code) => {
            info!("Job {} finished with exit code {code}", job.job_id);
            code
        }
        Err(ProcessError::Cancelled) => {
            info!("Job {} cancelled", job.job_id);
            1
        }
        Err(e) => {
            error!("Job {} failed: {e}", job.job_id);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ChannelMessage, WorkerChannel};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn job_body(command: &str, args: &[&str]) -> String {
        serde_json::to_string(&JobRequest {
            job_id: Uuid::new_v4(),
            display_name: "test".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env: HashMap::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn worker_runs_the_job_and_reports_its_exit_code() {
        let channel = WorkerChannel::create(Duration::from_secs(5)).unwrap();
        let (out, inp) = channel.handles();
        let worker = tokio::spawn(async move { run_worker(&out, &inp).await });

        channel
            .send(&ChannelMessage::new(
                MessageType::NewJob,
                job_body("sh", &["-c", "exit 4"]),
            ))
            .await
            .unwrap();

        assert_eq!(worker.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn cancel_frame_stops_a_running_job() {
        let channel = WorkerChannel::create(Duration::from_secs(5)).unwrap();
        let (out, inp) = channel.handles();
        let worker = tokio::spawn(async move { run_worker(&out, &inp).await });

        channel
            .send(&ChannelMessage::new(
                MessageType::NewJob,
                job_body("sleep", &["30"]),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        channel
            .send(&ChannelMessage::new(MessageType::CancelJob, "{}"))
            .await
            .unwrap();

        let code = tokio::time::timeout(Duration::from_secs(15), worker)
            .await
            .expect("worker should stop after cancel")
            .unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn shutdown_before_job_exits_cleanly() {
        let channel = WorkerChannel::create(Duration::from_secs(5)).unwrap();
        let (out, inp) = channel.handles();
        let worker = tokio::spawn(async move { run_worker(&out, &inp).await });

        channel
            .send(&ChannelMessage::new(MessageType::Shutdown, ""))
            .await
            .unwrap();
        assert_eq!(worker.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_job_payload_fails_the_worker() {
        let channel = WorkerChannel::create(Duration::from_secs(5)).unwrap();
        let (out, inp) = channel.handles();
        let worker = tokio::spawn(async move { run_worker(&out, &inp).await });

        channel
            .send(&ChannelMessage::new(MessageType::NewJob, "not json"))
            .await
            .unwrap();
        assert_eq!(worker.await.unwrap(), 1);
    }
}
