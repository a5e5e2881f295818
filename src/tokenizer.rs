//! Tokenizer loading and vocabulary extension.

use std::path::Path;

use tokenizers::{
    AddedToken, PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationDirection,
    TruncationParams, TruncationStrategy,
};

use crate::error::{Result, SftError};
use crate::hub::ModelSource;

/// Padding token added to every tokenizer.
pub const PAD_TOKEN: &str = "[PAD]";

/// Placeholder tokens used by the anonymized autocomplete transcripts.
pub const DOMAIN_TOKENS: [&str; 6] = [
    "<AGENT_NAME>",
    "<PERSON>",
    "<URL>",
    "PHONE_NUMBER",
    "EMAIL_ADDRESS",
    "<CREDIT_CARD>",
];

/// A tokenizer extended with the padding and domain tokens.
#[derive(Clone)]
pub struct PreparedTokenizer {
    inner: Tokenizer,
    pad_token_id: u32,
}

impl std::fmt::Debug for PreparedTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("pad_token_id", &self.pad_token_id)
            .finish()
    }
}

impl PreparedTokenizer {
    /// Resolve the tokenizer of `source` and extend it.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer cannot be resolved or parsed.
    pub fn load(source: &ModelSource) -> Result<Self> {
        let path = source.tokenizer_file()?;
        tracing::info!("Loading tokenizer from {}", path.display());
        Self::prepare(Tokenizer::from_file(path)?)
    }

    /// Add `[PAD]` and the domain tokens, and pad on the right with `[PAD]`.
    ///
    /// Tokens already present in the vocabulary are not added twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the pad token has no id after insertion.
    pub fn prepare(mut tokenizer: Tokenizer) -> Result<Self> {
        let before = tokenizer.get_vocab_size(true);

        tokenizer.add_special_tokens(&[AddedToken::from(PAD_TOKEN, true)]);
        let domain: Vec<AddedToken> = DOMAIN_TOKENS
            .iter()
            .map(|token| AddedToken::from(*token, false))
            .collect();
        tokenizer.add_tokens(&domain);

        let pad_token_id = tokenizer
            .token_to_id(PAD_TOKEN)
            .ok_or_else(|| SftError::Model(format!("{PAD_TOKEN} has no id after insertion")))?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Right,
            pad_id: pad_token_id,
            pad_token: PAD_TOKEN.to_string(),
            ..Default::default()
        }));

        let prepared = Self {
            inner: tokenizer,
            pad_token_id,
        };
        tracing::info!(
            "Tokenizer vocabulary: {} -> {} (pad id {})",
            before,
            prepared.vocab_size(),
            pad_token_id
        );
        Ok(prepared)
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Id of the `[PAD]` token.
    #[must_use]
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Truncate encodings on the right to `max_length` tokens, special
    /// tokens included.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_length` cannot hold the special tokens.
    pub fn with_max_length(mut self, max_length: usize) -> Result<Self> {
        self.inner.with_truncation(Some(TruncationParams {
            max_length,
            strategy: TruncationStrategy::LongestFirst,
            direction: TruncationDirection::Right,
            stride: 0,
        }))?;
        Ok(self)
    }

    /// Maximum encoding length, if truncation is configured.
    #[must_use]
    pub fn max_length(&self) -> Option<usize> {
        self.inner.get_truncation().map(|params| params.max_length)
    }

    /// Encode one text into token ids, with special tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, true)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Write `tokenizer.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.inner.save(dir.join("tokenizer.json"), false)?;
        Ok(())
    }

    /// Access the underlying tokenizer.
    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::str::FromStr;

    /// Word-level tokenizer over a small fixed vocabulary.
    pub(crate) fn word_level_tokenizer(words: &[&str]) -> Tokenizer {
        let mut vocab = serde_json::Map::new();
        vocab.insert("[UNK]".into(), serde_json::json!(0));
        for (i, word) in words.iter().enumerate() {
            vocab.insert((*word).to_string(), serde_json::json!(i + 1));
        }
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    #[test]
    fn test_prepare_adds_seven_tokens() {
        let tokenizer = word_level_tokenizer(&["hello", "world", "call", "me"]);
        let before = tokenizer.get_vocab_size(true);

        let prepared = PreparedTokenizer::prepare(tokenizer).unwrap();
        assert_eq!(prepared.vocab_size(), before + 7);
        assert_eq!(prepared.pad_token_id() as usize, before);
    }

    #[test]
    fn test_domain_tokens_are_single_ids() {
        let prepared =
            PreparedTokenizer::prepare(word_level_tokenizer(&["call", "at"])).unwrap();
        let ids = prepared.encode("call <PERSON> at PHONE_NUMBER").unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(
            Some(ids[1]),
            prepared.inner().token_to_id("<PERSON>")
        );
    }

    #[test]
    fn test_padding_is_right_side() {
        let prepared = PreparedTokenizer::prepare(word_level_tokenizer(&["a", "b"])).unwrap();
        let padding = prepared.inner().get_padding().unwrap();
        assert!(matches!(padding.direction, PaddingDirection::Right));
        assert_eq!(padding.pad_id, prepared.pad_token_id());
    }

    #[test]
    fn test_encode_truncates() {
        let prepared = PreparedTokenizer::prepare(word_level_tokenizer(&["a"]))
            .unwrap()
            .with_max_length(3)
            .unwrap();
        assert_eq!(prepared.max_length(), Some(3));
        let ids = prepared.encode("a a a a a a").unwrap();
        assert_eq!(ids.len(), 3);
    }

    /// Word-level tokenizer whose post-processor appends `</s>`.
    fn eos_tokenizer() -> Tokenizer {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{
                "id": 3, "content": "</s>", "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            }],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": {
                "type": "TemplateProcessing",
                "single": [
                    { "Sequence": { "id": "A", "type_id": 0 } },
                    { "SpecialToken": { "id": "</s>", "type_id": 0 } }
                ],
                "pair": [
                    { "Sequence": { "id": "A", "type_id": 0 } },
                    { "Sequence": { "id": "B", "type_id": 1 } },
                    { "SpecialToken": { "id": "</s>", "type_id": 1 } }
                ],
                "special_tokens": {
                    "</s>": { "id": "</s>", "ids": [3], "tokens": ["</s>"] }
                }
            },
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, "a": 1, "b": 2, "</s>": 3 },
                "unk_token": "[UNK]"
            }
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    #[test]
    fn test_truncation_keeps_eos() {
        let prepared = PreparedTokenizer::prepare(eos_tokenizer())
            .unwrap()
            .with_max_length(4)
            .unwrap();

        let short = prepared.encode("a b").unwrap();
        assert_eq!(short, vec![1, 2, 3]);

        let long = prepared.encode("a b a b a b").unwrap();
        assert_eq!(long, vec![1, 2, 1, 3]);
    }

    #[test]
    fn test_prepare_is_idempotent_for_existing_tokens() {
        let prepared = PreparedTokenizer::prepare(word_level_tokenizer(&["a"])).unwrap();
        let size = prepared.vocab_size();
        let again = PreparedTokenizer::prepare(prepared.inner().clone()).unwrap();
        assert_eq!(again.vocab_size(), size);
    }
}
