//! Line-oriented terminal implementation of the ask/say boundary.

use anyhow::Result;
use std::io::{BufRead, Write};
use tandem_core::{
    AskAction, AskKind, AskReply, Message, MessageKind, SayKind, UserInteraction,
};

pub struct TerminalUi;

impl TerminalUi {
    pub fn new() -> Self {
        Self
    }

    fn label(kind: MessageKind) -> &'static str {
        match kind {
            MessageKind::Say(SayKind::Task) => "task",
            MessageKind::Say(SayKind::Text) => "agent",
            MessageKind::Say(SayKind::Reasoning) => "thinking",
            MessageKind::Say(SayKind::Error) => "error",
            MessageKind::Say(SayKind::Tool) => "tool",
            MessageKind::Say(SayKind::CommandOutput) => "output",
            MessageKind::Say(SayKind::CheckpointCreated) => "checkpoint",
            MessageKind::Say(SayKind::CompletionResult) => "result",
            MessageKind::Say(SayKind::UserFeedback) => "you",
            MessageKind::Say(_) => "info",
            MessageKind::Ask(AskKind::Followup) => "question",
            MessageKind::Ask(AskKind::ApiReqFailed) => "api error",
            MessageKind::Ask(_) => "approve?",
        }
    }
}

impl UserInteraction for TerminalUi {
    fn show(&self, message: &Message) -> Result<()> {
        // Partial deltas would spam a line-oriented terminal; only the
        // finalized form is printed.
        if message.partial {
            return Ok(());
        }
        if message.is_say(SayKind::ApiReqStarted) {
            return Ok(());
        }
        if let Some(text) = &message.text {
            println!("[{}] {}", Self::label(message.kind), text);
        }
        Ok(())
    }

    fn solicit(&self, message: &Message) -> Result<AskReply> {
        if let Some(text) = &message.text {
            println!("[{}] {}", Self::label(message.kind), text);
        }
        print!("  approve [y], reject [n], or type a response: ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let trimmed = line.trim();
        Ok(match trimmed {
            "" | "y" | "yes" => AskReply::approve(),
            "n" | "no" => AskReply::reject(),
            other => AskReply {
                action: AskAction::Respond,
                text: Some(other.to_string()),
                images: vec![],
            },
        })
    }
}
