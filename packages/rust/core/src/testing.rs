//! Scripted text generator for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use designlens_llm::{GenerateRequest, Generation, LlmError, TextGenerator};

#[derive(Clone)]
enum Step {
    Reply(Generation),
    Fail(String),
    Delay(Duration, Generation),
}

/// Replays queued responses in order, then repeats the fallback response.
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    otherwise: Step,
    seen: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedGenerator {
    /// Answers every call with unparseable text unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            otherwise: Step::Reply(text("I'm not sure how to format that.")),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, generation: Generation) -> Self {
        self.push(Step::Reply(generation))
    }

    pub fn reply_text(self, content: &str) -> Self {
        self.push(Step::Reply(text(content)))
    }

    pub fn fail(self, message: &str) -> Self {
        self.push(Step::Fail(message.into()))
    }

    pub fn delay(self, delay: Duration, content: &str) -> Self {
        self.push(Step::Delay(delay, text(content)))
    }

    /// Every call sleeps for `delay` before answering with unparseable text.
    pub fn always_delay(mut self, delay: Duration) -> Self {
        self.otherwise = Step::Delay(delay, text("too late"));
        self
    }

    pub fn always_fail(mut self, message: &str) -> Self {
        self.otherwise = Step::Fail(message.into());
        self
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn push(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }
}

fn text(content: &str) -> Generation {
    Generation {
        content: content.into(),
        ..Generation::default()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, LlmError> {
        self.seen.lock().unwrap().push(request.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        match step {
            Step::Reply(generation) => Ok(generation),
            Step::Fail(message) => Err(LlmError::provider(Some(503), message, false)),
            Step::Delay(delay, generation) => {
                tokio::time::sleep(delay).await;
                Ok(generation)
            }
        }
    }
}
