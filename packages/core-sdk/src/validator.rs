use crate::error::{GatewayError, Result};
use crate::models::{ChatRequest, Provider, ProviderFamily};

/**
 * \brief Generation parameters a caller may set, in validation order.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Temperature,
    MaxTokens,
    TopP,
    TopK,
    FrequencyPenalty,
    PresencePenalty,
    RepeatPenalty,
    Stop,
}

impl Param {
    pub const ALL: [Param; 8] = [
        Param::Temperature,
        Param::MaxTokens,
        Param::TopP,
        Param::TopK,
        Param::FrequencyPenalty,
        Param::PresencePenalty,
        Param::RepeatPenalty,
        Param::Stop,
    ];

    /** \brief Request field name, as the caller spelled it. */
    pub fn name(self) -> &'static str {
        match self {
            Param::Temperature => "temperature",
            Param::MaxTokens => "maxTokens",
            Param::TopP => "topP",
            Param::TopK => "topK",
            Param::FrequencyPenalty => "frequencyPenalty",
            Param::PresencePenalty => "presencePenalty",
            Param::RepeatPenalty => "repeatPenalty",
            Param::Stop => "stop",
        }
    }

    fn is_set(self, req: &ChatRequest) -> bool {
        match self {
            Param::Temperature => req.temperature.is_some(),
            Param::MaxTokens => req.max_tokens.is_some(),
            Param::TopP => req.top_p.is_some(),
            Param::TopK => req.top_k.is_some(),
            Param::FrequencyPenalty => req.frequency_penalty.is_some(),
            Param::PresencePenalty => req.presence_penalty.is_some(),
            Param::RepeatPenalty => req.repeat_penalty.is_some(),
            Param::Stop => req.stop.is_some(),
        }
    }
}

const OPENAI_PARAMS: &[Param] = &[
    Param::Temperature,
    Param::MaxTokens,
    Param::TopP,
    Param::FrequencyPenalty,
    Param::PresencePenalty,
    Param::Stop,
];
const REASONING_PARAMS: &[Param] = &[Param::MaxTokens];
const GEMINI_PARAMS: &[Param] = &[
    Param::Temperature,
    Param::MaxTokens,
    Param::TopP,
    Param::TopK,
    Param::Stop,
];
const ANTHROPIC_PARAMS: &[Param] = &[
    Param::Temperature,
    Param::MaxTokens,
    Param::TopP,
    Param::Stop,
];

/**
 * \brief OpenAI reasoning models: `o1`, `o3` and their dashed variants.
 */
pub fn is_reasoning_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    ["o1", "o3"]
        .iter()
        .any(|p| model == *p || model.starts_with(&format!("{p}-")))
}

/**
 * \brief Parameters the target accepts. Ollama accepts every parameter.
 */
pub fn supported_params(family: ProviderFamily, model: &str) -> &'static [Param] {
    match family {
        ProviderFamily::OpenAiCompatible if is_reasoning_model(model) => REASONING_PARAMS,
        ProviderFamily::OpenAiCompatible => OPENAI_PARAMS,
        ProviderFamily::Gemini => GEMINI_PARAMS,
        ProviderFamily::Anthropic => ANTHROPIC_PARAMS,
        ProviderFamily::Ollama => &Param::ALL,
    }
}

/**
 * \brief Human label for the target, used in rejection messages.
 */
pub fn target_label(provider: &Provider, model: &str) -> String {
    match provider.family {
        ProviderFamily::OpenAiCompatible if is_reasoning_model(model) => {
            format!("OpenAI reasoning model {model}")
        }
        ProviderFamily::OpenAiCompatible => format!("{} ({model})", provider.display_name),
        ProviderFamily::Anthropic => "Anthropic Claude".to_string(),
        ProviderFamily::Gemini => "Google Gemini".to_string(),
        ProviderFamily::Ollama => format!("Ollama ({model})"),
    }
}

/**
 * \brief The caller's parameters after validation; exactly what adapters may forward.
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub stream: Option<bool>,
}

/**
 * \brief Rejects the request when any set parameter is unsupported by the target.
 * \details All offending fields are reported at once. Nothing is defaulted or
 * dropped; the returned params mirror the request.
 */
pub fn validate(provider: &Provider, model: &str, req: &ChatRequest) -> Result<ValidatedParams> {
    let supported = supported_params(provider.family, model);
    let rejected: Vec<String> = Param::ALL
        .iter()
        .filter(|p| p.is_set(req) && !supported.contains(*p))
        .map(|p| p.name().to_string())
        .collect();
    if !rejected.is_empty() {
        return Err(GatewayError::UnsupportedParameters {
            target: target_label(provider, model),
            fields: rejected,
        });
    }
    Ok(ValidatedParams {
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        top_p: req.top_p,
        top_k: req.top_k,
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
        repeat_penalty: req.repeat_penalty,
        stop: req.stop.clone(),
        stream: req.stream,
    })
}
