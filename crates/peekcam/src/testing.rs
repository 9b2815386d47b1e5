//! Test doubles shared by the unit tests of several modules.

use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::surface::{DisplaySurface, ErrorReporter, UserMessage};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

struct Rule {
    needle: String,
    output: CommandOutput,
    delay: Duration,
}

/// Answers commands from a script instead of spawning processes
///
/// The first rule whose needle occurs in the command line wins. Unmatched
/// commands behave as if the program were not installed.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, output: CommandOutput) -> Self {
        self.on_delayed(needle, output, Duration::ZERO)
    }

    pub fn on_delayed(self, needle: &str, output: CommandOutput, delay: Duration) -> Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            output,
            delay,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        spec: CommandSpec,
        timeout: Duration,
    ) -> impl Future<Output = CommandOutput> + Send {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());
        let scripted = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|rule| line.contains(&rule.needle))
            .map(|rule| (rule.output.clone(), rule.delay));

        async move {
            match scripted {
                Some((_, delay)) if delay >= timeout => {
                    tokio::time::sleep(timeout).await;
                    CommandOutput::timed_out(timeout)
                }
                Some((output, delay)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    output
                }
                None => CommandOutput::spawn_failed(&std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "No such file or directory",
                )),
            }
        }
    }
}

/// Records everything shown or resized
#[derive(Default)]
pub struct RecordingSurface {
    pub frames: Mutex<Vec<(PathBuf, u64)>>,
    pub resizes: Mutex<Vec<(u32, u32)>>,
}

impl RecordingSurface {
    pub fn frame_indices(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|(_, i)| *i).collect()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().unwrap().clone()
    }
}

impl DisplaySurface for RecordingSurface {
    fn show_frame(&self, path: &Path, index: u64) {
        self.frames.lock().unwrap().push((path.to_path_buf(), index));
    }

    fn resize(&self, width: u32, height: u32) {
        self.resizes.lock().unwrap().push((width, height));
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub messages: Mutex<Vec<UserMessage>>,
}

impl RecordingReporter {
    pub fn titles(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.title.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, message: &UserMessage) {
        self.messages.lock().unwrap().push(message.clone());
    }
}
