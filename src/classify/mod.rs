//! Message classification
//!
//! Maps `{subject, body, from}` to one of six closed categories. The
//! remote model is optional; classification never fails, because every
//! error path collapses into the deterministic keyword fallback.

mod remote;

pub use remote::{RemoteClassifier, RemoteClassifierConfig};

use async_trait::async_trait;

use crate::types::Category;

/// Subject is truncated to this many characters before any remote call.
pub const SUBJECT_LIMIT: usize = 500;
/// Body is truncated to this many characters before any remote call.
pub const BODY_LIMIT: usize = 4_000;

// Fallback keyword sets, checked in this priority order. First hit wins.
const SPAM_KEYWORDS: &[&str] = &[
    "unsubscribe",
    "promotional",
    "offer",
    "discount",
    "limited time",
    "act now",
];
const OUT_OF_OFFICE_KEYWORDS: &[&str] = &[
    "out of office",
    "vacation",
    "away",
    "automatic reply",
    "auto-reply",
];
const MEETING_BOOKED_KEYWORDS: &[&str] = &[
    "meeting",
    "call",
    "schedule",
    "appointment",
    "booked",
    "calendar",
];
const NOT_INTERESTED_KEYWORDS: &[&str] = &[
    "not interested",
    "decline",
    "reject",
    "no thank",
    "pass",
];
const INTERESTED_KEYWORDS: &[&str] = &[
    "interested",
    "yes",
    "sounds good",
    "let's do",
    "count me in",
];

/// Classification input. Fields are truncated by the caller of any remote
/// model via [`ClassifyInput::truncated`].
#[derive(Debug, Clone)]
pub struct ClassifyInput {
    pub subject: String,
    pub body: String,
    pub from: String,
}

impl ClassifyInput {
    /// Copy with subject and body cut to the remote-call limits.
    pub fn truncated(&self) -> Self {
        Self {
            subject: truncate_chars(&self.subject, SUBJECT_LIMIT),
            body: truncate_chars(&self.body, BODY_LIMIT),
            from: self.from.clone(),
        }
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

/// Deterministic keyword fallback over normalized `subject || body`.
pub fn keyword_fallback(subject: &str, body: &str) -> Category {
    let haystack = format!("{} {}", subject, body).to_lowercase();

    let ordered: [(&[&str], Category); 5] = [
        (SPAM_KEYWORDS, Category::Spam),
        (OUT_OF_OFFICE_KEYWORDS, Category::OutOfOffice),
        (MEETING_BOOKED_KEYWORDS, Category::MeetingBooked),
        (NOT_INTERESTED_KEYWORDS, Category::NotInterested),
        (INTERESTED_KEYWORDS, Category::Interested),
    ];

    for (keywords, category) in ordered {
        if keywords.iter().any(|kw| haystack.contains(kw)) {
            return category;
        }
    }

    Category::Uncategorized
}

/// Infallible message classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: &ClassifyInput) -> Category;
}

/// The keyword fallback on its own; used when no remote model is configured.
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, input: &ClassifyInput) -> Category {
        keyword_fallback(&input.subject, &input.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(subject: &str, body: &str) -> ClassifyInput {
        ClassifyInput {
            subject: subject.to_string(),
            body: body.to_string(),
            from: "peer@example.com".to_string(),
        }
    }

    #[test]
    fn fallback_priority_order_is_fixed() {
        // "unsubscribe" (Spam) outranks "meeting" (Meeting Booked).
        assert_eq!(
            keyword_fallback("meeting notes", "click unsubscribe below"),
            Category::Spam
        );
        // "vacation" (Out of Office) outranks "interested".
        assert_eq!(
            keyword_fallback("on vacation", "still interested though"),
            Category::OutOfOffice
        );
        // "decline" (Not Interested) outranks "interested".
        assert_eq!(
            keyword_fallback("re: offer... actually no", ""),
            Category::Spam
        );
        assert_eq!(
            keyword_fallback("we decline", "was interested at first"),
            Category::NotInterested
        );
    }

    #[test]
    fn fallback_matches_each_set() {
        assert_eq!(keyword_fallback("limited time deal", ""), Category::Spam);
        assert_eq!(keyword_fallback("", "automatic reply: away"), Category::OutOfOffice);
        assert_eq!(keyword_fallback("calendar invite", ""), Category::MeetingBooked);
        assert_eq!(keyword_fallback("", "no thank you"), Category::NotInterested);
        assert_eq!(keyword_fallback("sounds good!", ""), Category::Interested);
        assert_eq!(keyword_fallback("quarterly numbers", "attached"), Category::Uncategorized);
    }

    #[test]
    fn fallback_is_case_insensitive_and_deterministic() {
        let first = keyword_fallback("SOUNDS GOOD", "");
        let second = keyword_fallback("SOUNDS GOOD", "");
        assert_eq!(first, Category::Interested);
        assert_eq!(first, second);
    }

    #[test]
    fn truncation_limits_subject_and_body() {
        let long = input(&"s".repeat(1_000), &"b".repeat(10_000));
        let cut = long.truncated();
        assert_eq!(cut.subject.chars().count(), SUBJECT_LIMIT);
        assert_eq!(cut.body.chars().count(), BODY_LIMIT);

        let short = input("hello", "world");
        let same = short.truncated();
        assert_eq!(same.subject, "hello");
        assert_eq!(same.body, "world");
    }

    #[tokio::test]
    async fn keyword_classifier_never_fails() {
        let classifier = KeywordClassifier;
        let category = classifier.classify(&input("", "")).await;
        assert_eq!(category, Category::Uncategorized);
    }
}
