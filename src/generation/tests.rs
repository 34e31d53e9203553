use super::*;
use std::sync::{Arc, Mutex};

/// Returns a canned completion and records the prompts it was given
struct ScriptedModel {
    name: &'static str,
    reply: String,
    prompts: Arc<Mutex<Vec<(String, u32)>>>,
}

impl ScriptedModel {
    fn new(name: &'static str, reply: &str) -> (Self, Arc<Mutex<Vec<(String, u32)>>>) {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let model = Self {
            name,
            reply: reply.to_string(),
            prompts: Arc::clone(&prompts),
        };
        (model, prompts)
    }
}

impl TextGenerator for ScriptedModel {
    fn model_name(&self) -> &str {
        self.name
    }

    fn generate(&self, prompt: &str, max_new_tokens: u32) -> Result<String> {
        self.prompts
            .lock()
            .expect("lock is not poisoned")
            .push((prompt.to_string(), max_new_tokens));
        Ok(self.reply.replace("{prompt}", prompt))
    }
}

fn generator(causal_reply: &str, seq2seq_reply: &str) -> AnswerGenerator {
    let (causal, _) = ScriptedModel::new("causal-model", causal_reply);
    let (seq2seq, _) = ScriptedModel::new("seq2seq-model", seq2seq_reply);
    AnswerGenerator::new(Box::new(causal), Box::new(seq2seq))
}

#[test]
fn model_choice_parses_names_and_aliases() {
    assert_eq!("causal".parse::<ModelChoice>().ok(), Some(ModelChoice::Causal));
    assert_eq!("GPT2".parse::<ModelChoice>().ok(), Some(ModelChoice::Causal));
    assert_eq!("seq2seq".parse::<ModelChoice>().ok(), Some(ModelChoice::Seq2Seq));
    assert_eq!(" bart ".parse::<ModelChoice>().ok(), Some(ModelChoice::Seq2Seq));
}

#[test]
fn unknown_model_choice_is_rejected() {
    let err = "t5".parse::<ModelChoice>().expect_err("t5 is not a choice");
    assert!(matches!(err, RagError::InvalidModelChoice(ref s) if s == "t5"));
}

#[test]
fn model_choice_display_and_serde_agree() {
    for choice in ModelChoice::ALL {
        let json = serde_json::to_value(choice).expect("choice serializes");
        assert_eq!(json, serde_json::Value::String(choice.to_string()));
        assert_eq!(choice.to_string().parse::<ModelChoice>().ok(), Some(choice));
    }
}

#[test]
fn prompt_templates() {
    assert_eq!(
        ModelChoice::Causal.prompt("How many days?", "15 days."),
        "Context: 15 days.\n\nQuestion: How many days?\nAnswer:"
    );
    assert_eq!(
        ModelChoice::Seq2Seq.prompt("How many days?", "15 days."),
        "question: How many days? context: 15 days."
    );
}

#[test]
fn long_context_is_truncated_to_input_budget() {
    let generator = generator("x", "x").with_max_input_tokens(32);
    let context = "Employees accrue vacation monthly. ".repeat(20);
    assert!(context.len() > 600);

    for choice in ModelChoice::ALL {
        let prompt = generator.build_prompt("How many vacation days?", &context, choice);
        assert!(estimate_token_count(&prompt) <= 32, "prompt too long: {prompt}");
        assert!(prompt.contains("How many vacation days?"));
        assert!(prompt.contains("Employees accrue"));
    }
}

#[test]
fn short_context_is_kept_whole() {
    let generator = generator("x", "x");
    let prompt = generator.build_prompt(
        "How many vacation days?",
        "Employees get 15 vacation days per year.",
        ModelChoice::Seq2Seq,
    );
    assert_eq!(
        prompt,
        "question: How many vacation days? context: Employees get 15 vacation days per year."
    );
}

#[test]
fn generate_uses_selected_model_and_token_limit() {
    let (causal, causal_prompts) = ScriptedModel::new("causal-model", " 15 days");
    let (seq2seq, seq2seq_prompts) = ScriptedModel::new("seq2seq-model", "fifteen");
    let generator =
        AnswerGenerator::new(Box::new(causal), Box::new(seq2seq)).with_max_new_tokens(20);

    let answer = generator
        .generate("How many days?", "15 days.", ModelChoice::Seq2Seq)
        .expect("generation succeeds");
    assert_eq!(answer, "fifteen");
    assert!(causal_prompts.lock().expect("lock is not poisoned").is_empty());

    let prompts = seq2seq_prompts.lock().expect("lock is not poisoned");
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].1, 20);
    assert!(prompts[0].0.starts_with("question: How many days?"));
    assert_eq!(generator.model(ModelChoice::Causal).model_name(), "causal-model");
}

#[test]
fn special_tokens_are_stripped() {
    assert_eq!(
        strip_special_tokens("<s>Fifteen days.</s><pad><|endoftext|>"),
        "Fifteen days."
    );
    assert_eq!(strip_special_tokens("[CLS] yes [SEP]"), " yes ");
    assert_eq!(strip_special_tokens("<extra_id_0>ok"), "ok");
    assert_eq!(strip_special_tokens("a < b and c > d"), "a < b and c > d");
}

#[test]
fn echoed_prompt_is_removed() {
    let generator = generator("{prompt} 15 days.<|endoftext|>", "x");
    let answer = generator
        .generate("How many days?", "15 days.", ModelChoice::Causal)
        .expect("generation succeeds");
    assert_eq!(answer, "15 days.");
}

#[test]
fn causal_answer_stops_at_next_question() {
    let generator = generator(" 15 days.\nQuestion: And sick days?\nAnswer: 5", "x");
    let answer = generator
        .generate("How many days?", "15 days.", ModelChoice::Causal)
        .expect("generation succeeds");
    assert_eq!(answer, "15 days.");
}

#[test]
fn empty_answer_is_an_error() {
    let generator = generator("x", "</s><pad>   ");
    let result = generator.generate("How many days?", "15 days.", ModelChoice::Seq2Seq);
    assert!(matches!(result, Err(RagError::Generation(msg)) if msg.contains("seq2seq-model")));
}
