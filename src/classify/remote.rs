//! Remote LLM classification
//!
//! Sends the (truncated) message to a local model server and maps the
//! reply onto the closed category set. Unreachable server, bad status,
//! or an unrecognized reply all fall back to the keyword rules.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use async_trait::async_trait;

use super::{keyword_fallback, Classifier, ClassifyInput};
use crate::types::Category;

/// Prompt template sent to the model.
const CLASSIFICATION_PROMPT: &str = r#"Classify this email into exactly one category.

Categories:
- Interested: the sender expresses interest in proceeding
- Meeting Booked: a meeting or call has been scheduled or confirmed
- Not Interested: the sender declines or rejects
- Spam: promotional or unsolicited bulk mail
- Out of Office: automatic absence reply
- Uncategorized: none of the above

Email:
From: {from}
Subject: {subject}
Body: {body}

Respond with ONLY the category name. Nothing else."#;

#[derive(Debug, Clone)]
pub struct RemoteClassifierConfig {
    pub url: String,
    pub model: String,
}

impl Default for RemoteClassifierConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "mistral:latest".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct RemoteClassifier {
    client: Client,
    config: RemoteClassifierConfig,
}

impl RemoteClassifier {
    pub fn new(config: RemoteClassifierConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn build_prompt(input: &ClassifyInput) -> String {
        CLASSIFICATION_PROMPT
            .replace("{from}", &input.from)
            .replace(
                "{subject}",
                if input.subject.is_empty() { "(no subject)" } else { &input.subject },
            )
            .replace("{body}", &input.body)
    }

    async fn call_model(&self, prompt: &str) -> Result<String, String> {
        let url = format!("{}/api/generate", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": 20
            }
        });

        debug!(url = %url, model = %self.config.model, "Calling classification model");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("model returned status {}", response.status()));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| format!("bad response body: {}", e))?;

        Ok(parsed.response)
    }

    /// Map a model reply onto a category, if it names one.
    fn parse_reply(reply: &str) -> Option<Category> {
        if let Some(category) = Category::from_label(reply) {
            return Some(category);
        }
        // The model sometimes wraps the label in extra prose; probe for a
        // contained label, longest names first so "Not Interested" is not
        // shadowed by "Interested".
        let lowered = reply.to_lowercase();
        for category in [
            Category::MeetingBooked,
            Category::NotInterested,
            Category::OutOfOffice,
            Category::Uncategorized,
            Category::Interested,
            Category::Spam,
        ] {
            if lowered.contains(&category.as_str().to_lowercase()) {
                return Some(category);
            }
        }
        None
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify(&self, input: &ClassifyInput) -> Category {
        let truncated = input.truncated();
        let prompt = Self::build_prompt(&truncated);

        match self.call_model(&prompt).await {
            Ok(reply) => match Self::parse_reply(&reply) {
                Some(category) => category,
                None => {
                    warn!(reply = %reply.trim(), "Unrecognized model reply, using fallback");
                    keyword_fallback(&truncated.subject, &truncated.body)
                }
            },
            Err(reason) => {
                warn!(%reason, "Remote classification failed, using fallback");
                keyword_fallback(&truncated.subject, &truncated.body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_accepts_exact_labels() {
        assert_eq!(RemoteClassifier::parse_reply("Spam"), Some(Category::Spam));
        assert_eq!(
            RemoteClassifier::parse_reply("  meeting booked \n"),
            Some(Category::MeetingBooked)
        );
    }

    #[test]
    fn parse_reply_probes_wrapped_labels() {
        assert_eq!(
            RemoteClassifier::parse_reply("The category is: Not Interested."),
            Some(Category::NotInterested)
        );
        assert_eq!(
            RemoteClassifier::parse_reply("Out of Office (automatic reply)"),
            Some(Category::OutOfOffice)
        );
    }

    #[test]
    fn parse_reply_rejects_noise() {
        assert_eq!(RemoteClassifier::parse_reply("I cannot classify this"), None);
        assert_eq!(RemoteClassifier::parse_reply(""), None);
    }

    #[tokio::test]
    async fn unreachable_server_falls_back_deterministically() {
        let classifier = RemoteClassifier::new(RemoteClassifierConfig {
            // Nothing listens here; the request fails fast.
            url: "http://127.0.0.1:9".to_string(),
            model: "test".to_string(),
        });
        let input = ClassifyInput {
            subject: "let's schedule a call".to_string(),
            body: String::new(),
            from: "peer@example.com".to_string(),
        };

        let first = classifier.classify(&input).await;
        let second = classifier.classify(&input).await;
        assert_eq!(first, Category::MeetingBooked);
        assert_eq!(first, second);
    }
}
