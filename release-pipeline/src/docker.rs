// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Sandboxed artifact builds through a container engine.

Release artifacts may only be produced inside a disposable container build.
The driver generates build instructions from the release configuration,
streams the worktree as the build context, and recovers the artifact tar
from the build output: the final build step archives `/result` and emits it
base64 encoded between sentinel lines, which is the one exfiltration channel
a line-oriented build stream offers without a post-build copy step.
*/

use {
    crate::{
        error::{PipelineError, Result},
        gitrepo::append_dir_to_tar,
        pipe::PipeWriter,
    },
    log::debug,
    std::{
        collections::VecDeque,
        io::{BufRead, BufReader, Read, Write},
        path::Path,
        process::{Command, Stdio},
    },
};

/// Directory inside the build that commands must populate.
pub const RESULT_DIR: &str = "/result";

/// In-context path of the generated build instructions.
const INSTRUCTIONS_PATH: &str = ".build/instructions";

const ARTIFACTS_BEGIN: &str = "-----BEGIN RELEASE ARTIFACTS TAR-----";
const ARTIFACTS_END: &str = "-----END RELEASE ARTIFACTS TAR-----";

/// How many trailing output lines are kept for failure diagnostics.
const DIAGNOSTIC_TAIL_LINES: usize = 50;

/// Render the build instructions for a release build.
///
/// The worktree is copied to `/workspace`, each command runs in order, and
/// the final step frames the `/result` tar on stdout.
pub fn generate_build_instructions(from_image: &str, commands: &[String]) -> String {
    let mut lines = vec![
        format!("FROM {}", from_image),
        "COPY . /workspace".to_string(),
        "WORKDIR /workspace".to_string(),
        format!("RUN mkdir -p {}", RESULT_DIR),
    ];

    for command in commands {
        lines.push(format!("RUN {}", command));
    }

    lines.push(format!(
        "RUN echo '{begin}' && tar -c -C {result} . | base64 && echo '{end}'",
        begin = ARTIFACTS_BEGIN,
        result = RESULT_DIR,
        end = ARTIFACTS_END,
    ));

    lines.join("\n") + "\n"
}

/// Whether a docker engine is reachable from this process.
pub fn check_container_engine() -> Result<()> {
    let status = Command::new("docker")
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| PipelineError::ContainerEngineUnavailable(e.to_string()))?;

    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::ContainerEngineUnavailable(format!(
            "docker version exited with {}",
            status
        )))
    }
}

/// Run a sandboxed release build, streaming the artifact tar into `artifacts`.
///
/// Blocking; the caller runs it on a blocking-capable thread. The pipe is
/// closed exactly once: cleanly on success, with the build error otherwise,
/// so the consumer decoding the artifact tar always terminates.
pub fn build_release_artifacts(
    worktree: &Path,
    from_image: &str,
    commands: &[String],
    artifacts: PipeWriter,
) -> Result<()> {
    let mut sink = ArtifactSink::new(artifacts);

    match run_build(worktree, from_image, commands, &mut sink) {
        Ok(()) => {
            sink.close();
            Ok(())
        }
        Err(e) => {
            sink.close_with_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ));
            Err(e)
        }
    }
}

fn run_build(
    worktree: &Path,
    from_image: &str,
    commands: &[String],
    sink: &mut ArtifactSink,
) -> Result<()> {
    let mut child = Command::new("docker")
        .args([
            "build",
            "--pull",
            "--no-cache",
            "--rm",
            "--force-rm",
            "-f",
            INSTRUCTIONS_PATH,
            "-",
        ])
        .env("DOCKER_BUILDKIT", "0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PipelineError::ContainerEngineUnavailable(e.to_string()))?;

    // The context tar is produced concurrently so the engine applies
    // back-pressure to us instead of us buffering the whole worktree.
    let stdin = child.stdin.take().expect("stdin was requested piped");
    let instructions = generate_build_instructions(from_image, commands);
    let (producer_result, scan_result, stderr_tail) = std::thread::scope(|scope| {
        let producer = scope.spawn(move || -> Result<()> {
            let mut builder = tar::Builder::new(stdin);
            append_dir_to_tar(worktree, &mut builder)?;
            append_instructions_to_tar(&mut builder, &instructions)?;
            builder.into_inner()?.flush()?;

            Ok(())
        });

        let stderr = child.stderr.take().expect("stderr was requested piped");
        let stderr_tail = scope.spawn(move || drain_tail(stderr));

        let stdout = child.stdout.take().expect("stdout was requested piped");
        let scan_result = scan_build_output(BufReader::new(stdout), sink);

        debug!("finished scanning build output of {}", worktree.display());

        (
            producer.join().expect("context producer panicked"),
            scan_result,
            stderr_tail.join().expect("stderr drain panicked"),
        )
    });

    let status = child.wait()?;

    if !status.success() {
        let mut tail = match &scan_result {
            Ok(tail) => tail.clone(),
            Err(_) => VecDeque::new(),
        };
        tail.extend(stderr_tail);

        return Err(PipelineError::ContainerBuild(format!(
            "build exited with {}: {}",
            status,
            tail.into_iter().collect::<Vec<_>>().join("\n"),
        )));
    }

    // A broken context pipe usually just reflects a failed build; with a
    // successful build it is a real error.
    producer_result?;
    scan_result?;

    Ok(())
}

fn append_instructions_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    instructions: &str,
) -> Result<()> {
    let data = instructions.as_bytes();

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder.append_data(&mut header, INSTRUCTIONS_PATH, data)?;

    Ok(())
}

/// Scan engine output, forwarding decoded artifact bytes to `sink`.
///
/// Returns the trailing non-payload lines for failure diagnostics.
fn scan_build_output<R: BufRead>(
    output: R,
    sink: &mut ArtifactSink,
) -> Result<VecDeque<String>> {
    let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
    let mut in_payload = false;

    for line in output.lines() {
        let line = line?;
        let trimmed = line.trim();

        if trimmed == ARTIFACTS_BEGIN {
            in_payload = true;
        } else if trimmed == ARTIFACTS_END {
            in_payload = false;
        } else if in_payload {
            let decoded = base64::decode(trimmed).map_err(|e| {
                PipelineError::ContainerBuild(format!("malformed artifact stream: {}", e))
            })?;

            sink.write_all(&decoded)?;
        } else {
            if tail.len() == DIAGNOSTIC_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    Ok(tail)
}

fn drain_tail<R: Read>(source: R) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);

    for line in BufReader::new(source).lines().flatten() {
        if tail.len() == DIAGNOSTIC_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail
}

/// Owns the artifact pipe writer until the single close decision is made.
struct ArtifactSink {
    writer: Option<PipeWriter>,
}

impl ArtifactSink {
    fn new(writer: PipeWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.writer {
            Some(writer) => writer.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "artifact sink already closed",
            )),
        }
    }

    fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.close();
        }
    }

    fn close_with_error(&mut self, error: std::io::Error) {
        if let Some(writer) = self.writer.take() {
            writer.close_with_error(error);
        }
    }
}
