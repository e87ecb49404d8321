//! Prepare: raw event to model request. Pure function of its inputs; the
//! only reads (recent titles) happen before it is called.

use chrono::{DateTime, Utc};

use super::acquire::{estimate_tokens, Acquired, RawEvent, RawObservation};
use crate::memory_db::ObservationType;

pub const PROMPT_VERSION: &str = "v3";

/// What the session looks like from the model's point of view.
#[derive(Debug, Clone, Default)]
pub struct PrepareContext {
    pub project: String,
    pub user_prompt: String,
    /// The request continues an existing model session
    pub resuming: bool,
    /// Most recent first
    pub recent_titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenEstimate {
    pub input: usize,
    pub expected_output: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub token_estimate: TokenEstimate,
    pub context_included: bool,
    pub prompt_version: &'static str,
}

pub fn prepare(acquired: &Acquired, ctx: &PrepareContext) -> PreparedRequest {
    let mut prompt = String::new();
    if ctx.resuming && acquired.prompt_number > 1 {
        prompt.push_str(&continuation_prompt(&ctx.user_prompt, acquired.prompt_number));
        prompt.push_str("\n\n");
    }

    let context_included = !ctx.recent_titles.is_empty();
    if context_included {
        prompt.push_str(&recent_context(&ctx.recent_titles));
        prompt.push_str("\n\n");
    }

    let expected_output = match &acquired.event {
        RawEvent::Observation(obs) => {
            prompt.push_str(&observation_prompt(obs));
            400
        }
        RawEvent::Summarize {
            last_assistant_message,
        } => {
            prompt.push_str(&summary_prompt(last_assistant_message));
            600
        }
    };

    let system_prompt = if ctx.resuming {
        None
    } else {
        let date = DateTime::<Utc>::from_timestamp_millis(acquired.created_at_epoch)
            .unwrap_or_default()
            .format("%Y-%m-%d")
            .to_string();
        Some(init_prompt(&ctx.project, &ctx.user_prompt, &date))
    };

    let input = estimate_tokens(&prompt)
        + system_prompt.as_deref().map(estimate_tokens).unwrap_or(0);

    PreparedRequest {
        prompt,
        system_prompt,
        token_estimate: TokenEstimate {
            input,
            expected_output,
        },
        context_included,
        prompt_version: PROMPT_VERSION,
    }
}

pub fn init_prompt(project: &str, user_prompt: &str, date: &str) -> String {
    let types: Vec<&str> = ObservationType::ALL.iter().map(|t| t.as_str()).collect();
    format!(
        r#"You are a memory observer for a coding session in project "{project}".
Record what was built, fixed, configured or learned so that future sessions can use it.
Describe the work itself, never your own observing.

User's goal: {user_prompt}
Date: {date}

Skip routine operations (empty listings, status checks, repeated reads). When skipping, output nothing.

For each tool execution worth remembering, answer with:
<observation>
  <type>one of: {types}</type>
  <title>short title of the core action</title>
  <subtitle>one sentence, at most 24 words</subtitle>
  <facts>
    <fact>self-contained statement with concrete names</fact>
  </facts>
  <narrative>what was done, how it works, why it matters</narrative>
  <concepts>
    <concept>how-it-works | why-it-exists | what-changed | problem-solution | gotcha | pattern | trade-off</concept>
  </concepts>
  <files_read><file>path/from/project/root</file></files_read>
  <files_modified><file>path/from/project/root</file></files_modified>
</observation>

The type is not a concept. Do not repeat it in <concepts>."#,
        project = project,
        user_prompt = user_prompt,
        date = date,
        types = types.join(" | "),
    )
}

pub fn observation_prompt(obs: &RawObservation) -> String {
    let time = DateTime::<Utc>::from_timestamp_millis(obs.created_at_epoch)
        .unwrap_or_default()
        .to_rfc3339();
    let cwd = obs
        .cwd
        .as_deref()
        .map(|cwd| format!("\n  <tool_cwd>{}</tool_cwd>", cwd))
        .unwrap_or_default();
    format!(
        "<tool_used>\n  <tool_name>{}</tool_name>\n  <tool_time>{}</tool_time>{}\n  <tool_input>{}</tool_input>\n  <tool_output>{}</tool_output>\n</tool_used>",
        obs.tool_name,
        time,
        cwd,
        pretty_json(&obs.tool_input),
        pretty_json(&obs.tool_output),
    )
}

pub fn summary_prompt(last_assistant_message: &str) -> String {
    let mut prompt = String::from(
        "PROGRESS SUMMARY CHECKPOINT\n\
         Summarize the observed session so far (not this observing session). \
         The session may continue after this checkpoint.\n\n\
         <summary>\n  \
         <request>short title of the latest request</request>\n  \
         <investigated>what was explored</investigated>\n  \
         <learned>how things work</learned>\n  \
         <completed>what shipped or changed</completed>\n  \
         <next_steps>current trajectory of work</next_steps>\n  \
         <notes>anything else worth keeping</notes>\n\
         </summary>\n\n\
         If nothing happened worth summarizing, answer <skip_summary reason=\"...\"/> instead.",
    );
    if !last_assistant_message.trim().is_empty() {
        prompt.push_str("\n\nThe assistant's last message was:\n");
        prompt.push_str(last_assistant_message.trim());
    }
    prompt
}

pub fn continuation_prompt(user_prompt: &str, prompt_number: i64) -> String {
    format!("User's request #{}: {}", prompt_number, user_prompt)
}

fn recent_context(titles: &[String]) -> String {
    let mut out = String::from("Already recorded in this session:");
    for title in titles {
        out.push_str("\n- ");
        out.push_str(title);
    }
    out
}

/// Re-indent JSON payloads; anything else passes through untouched.
fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::acquire::AcquireMetadata;

    fn acquired(event: RawEvent, prompt_number: i64) -> Acquired {
        Acquired {
            event,
            prompt_number,
            created_at_epoch: 1_700_000_000_000,
            metadata: AcquireMetadata {
                input_token_estimate: 0,
                output_token_estimate: 0,
                tool_category: None,
            },
        }
    }

    fn observation() -> RawEvent {
        RawEvent::Observation(RawObservation {
            tool_name: "Read".into(),
            tool_input: r#"{"file_path":"src/main.rs"}"#.into(),
            tool_output: "fn main() {}".into(),
            cwd: Some("/work/app".into()),
            created_at_epoch: 1_700_000_000_000,
        })
    }

    #[test]
    fn test_fresh_request_carries_init_prompt() {
        let ctx = PrepareContext {
            project: "app".into(),
            user_prompt: "fix login".into(),
            ..Default::default()
        };
        let request = prepare(&acquired(observation(), 1), &ctx);

        let system = request.system_prompt.unwrap();
        assert!(system.contains("fix login"));
        assert!(system.contains("2023-11-14"));
        assert!(request.prompt.contains("<tool_name>Read</tool_name>"));
        assert!(request.prompt.contains("<tool_cwd>/work/app</tool_cwd>"));
        assert!(request.prompt.contains("\"file_path\": \"src/main.rs\""));
        assert!(!request.context_included);
    }

    #[test]
    fn test_resumed_request_is_continuation() {
        let ctx = PrepareContext {
            project: "app".into(),
            user_prompt: "now add tests".into(),
            resuming: true,
            recent_titles: vec!["Login fixed".into()],
        };
        let request = prepare(&acquired(observation(), 3), &ctx);

        assert!(request.system_prompt.is_none());
        assert!(request.prompt.starts_with("User's request #3: now add tests"));
        assert!(request.prompt.contains("- Login fixed"));
        assert!(request.context_included);
    }

    #[test]
    fn test_prepare_is_deterministic() {
        let ctx = PrepareContext {
            project: "app".into(),
            user_prompt: "x".into(),
            ..Default::default()
        };
        let event = acquired(
            RawEvent::Summarize {
                last_assistant_message: "done".into(),
            },
            2,
        );
        assert_eq!(prepare(&event, &ctx), prepare(&event, &ctx));
        assert!(prepare(&event, &ctx).prompt.contains("<skip_summary"));
    }
}
