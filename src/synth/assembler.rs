use std::collections::HashSet;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use super::capability::Capabilities;
use super::chunker::{chunk, Chunk};
use super::cleaner::{clean_answer, clean_question};
use super::distractors::generate_distractors;
use super::fallback::{content_based_fallback, generic_fallback};
use super::validator::{check_answer, QuestionValidator};
use super::{normalize_text, GenerationError, SynthConfig};
use crate::models::{GeneratedQuestion, OPTION_COUNT};

static CAPITALIZED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+\b").expect("capitalized regex"));

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationSource {
    Pipeline,
    ContentBased,
    Generic,
}

impl GenerationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationSource::Pipeline => "pipeline",
            GenerationSource::ContentBased => "content_based",
            GenerationSource::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AttemptStats {
    pub attempts: usize,
    pub rejected_questions: usize,
    pub rejected_answers: usize,
    pub capability_errors: usize,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub questions: Vec<GeneratedQuestion>,
    pub source: GenerationSource,
    pub stats: AttemptStats,
}

pub struct Synthesizer {
    config: SynthConfig,
    capabilities: Capabilities,
}

impl Synthesizer {
    pub fn new(config: SynthConfig, capabilities: Capabilities) -> Self {
        Self { config, capabilities }
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Generates exactly `requested` questions from `source`.
    ///
    /// Tries up to `requested * attempt_multiplier` candidates. Bad candidates
    /// and capability failures only cost an attempt. If none survive, the
    /// content-based fallback (or, without usable terms, the generic set) is
    /// returned instead; if some survive but too few, the rest is padded from
    /// the same fallbacks.
    pub fn assemble<R: Rng>(
        &self,
        source: &str,
        requested: usize,
        rng: &mut R,
    ) -> Result<GenerationOutcome, GenerationError> {
        if source.trim().is_empty() {
            return Err(GenerationError::EmptySource);
        }
        if requested == 0 || requested > self.config.max_requested {
            return Err(GenerationError::InvalidCount {
                requested,
                max: self.config.max_requested,
            });
        }

        let mut stats = AttemptStats::default();
        let chunks = match chunk(source, &self.config) {
            Ok(chunks) => chunks,
            Err(err) => {
                info!("quiz synthesis skipped the pipeline: {}", err);
                return Ok(Self::fallback(source, requested, stats));
            }
        };

        let mut results = Vec::with_capacity(requested);
        let mut validator = QuestionValidator::new(&self.config);
        let budget = requested * self.config.attempt_multiplier;

        for _ in 0..budget {
            if results.len() >= requested {
                break;
            }
            stats.attempts += 1;
            if let Some(question) = self.attempt(&chunks, source, &mut validator, &mut stats, rng) {
                results.push(question);
            }
        }

        let outcome = if results.is_empty() {
            Self::fallback(source, requested, stats)
        } else {
            let accepted = results.len();
            let questions = Self::pad(source, results, requested);
            if accepted < requested {
                info!("padded {} accepted questions up to {}", accepted, requested);
            }
            GenerationOutcome {
                questions,
                source: GenerationSource::Pipeline,
                stats,
            }
        };
        info!(
            "quiz synthesis finished: {} questions via {} after {} attempts ({} bad questions, {} bad answers, {} capability errors)",
            outcome.questions.len(),
            outcome.source.as_str(),
            outcome.stats.attempts,
            outcome.stats.rejected_questions,
            outcome.stats.rejected_answers,
            outcome.stats.capability_errors
        );
        Ok(outcome)
    }

    fn attempt<R: Rng>(
        &self,
        chunks: &[Chunk],
        source: &str,
        validator: &mut QuestionValidator<'_>,
        stats: &mut AttemptStats,
        rng: &mut R,
    ) -> Option<GeneratedQuestion> {
        let chunk = chunks.choose(rng)?;

        let raw = match self.capabilities.synthesizer.synthesize(&chunk.text, rng) {
            Ok(raw) => raw,
            Err(err) => {
                stats.capability_errors += 1;
                debug!("question synthesis failed: {}", err);
                return None;
            }
        };
        let question = clean_question(&raw);
        if let Err(reason) = validator.check(&question) {
            stats.rejected_questions += 1;
            debug!("skipping question {:?}: {}", question, reason);
            return None;
        }
        validator.remember(&question);

        let extracted = match self.capabilities.extractor.extract(&question, source) {
            Ok(extracted) => extracted,
            Err(err) => {
                stats.capability_errors += 1;
                debug!("answer extraction failed: {}", err);
                return None;
            }
        };
        let answer = clean_answer(&extracted.text);
        if let Err(reason) = check_answer(&answer, extracted.confidence, &self.config) {
            stats.rejected_answers += 1;
            debug!("skipping answer {:?} for {:?}: {}", answer, question, reason);
            return None;
        }

        let options = self.build_options(&answer, source, rng);
        Some(GeneratedQuestion::multiple_choice(question, options, answer))
    }

    /// Answer plus distractors, padded with capitalized source words and then
    /// `Option X` placeholders, shuffled.
    fn build_options<R: Rng>(&self, answer: &str, source: &str, rng: &mut R) -> Vec<String> {
        let mut options = vec![answer.to_string()];
        let contains = |options: &[String], candidate: &str| {
            let key = candidate.to_lowercase();
            options.iter().any(|o| o.to_lowercase() == key)
        };

        let wanted = self.config.distractor_count.min(OPTION_COUNT - 1);
        for distractor in generate_distractors(answer, wanted, source) {
            if options.len() < OPTION_COUNT && !contains(&options, &distractor) {
                options.push(distractor);
            }
        }

        if options.len() < OPTION_COUNT {
            let mut pool: Vec<&str> = CAPITALIZED.find_iter(source).map(|m| m.as_str()).collect();
            pool.shuffle(rng);
            for word in pool {
                if options.len() >= OPTION_COUNT {
                    break;
                }
                if !contains(&options, word) {
                    options.push(word.to_string());
                }
            }
        }

        let mut letter = b'A' + options.len() as u8;
        while options.len() < OPTION_COUNT {
            let placeholder = format!("Option {}", letter as char);
            if !contains(&options, &placeholder) {
                options.push(placeholder);
            }
            letter += 1;
        }

        options.shuffle(rng);
        options
    }

    fn fallback(source: &str, requested: usize, stats: AttemptStats) -> GenerationOutcome {
        match content_based_fallback(source, requested) {
            Some(questions) => GenerationOutcome {
                questions,
                source: GenerationSource::ContentBased,
                stats,
            },
            None => GenerationOutcome {
                questions: generic_fallback(requested),
                source: GenerationSource::Generic,
                stats,
            },
        }
    }

    fn pad(source: &str, mut results: Vec<GeneratedQuestion>, requested: usize) -> Vec<GeneratedQuestion> {
        if results.len() >= requested {
            return results;
        }
        let mut seen: HashSet<String> = results.iter().map(|q| normalize_text(&q.question)).collect();
        for extra in content_based_fallback(source, requested).unwrap_or_default() {
            if results.len() >= requested {
                break;
            }
            if seen.insert(normalize_text(&extra.question)) {
                results.push(extra);
            }
        }
        let missing = requested.saturating_sub(results.len());
        results.extend(generic_fallback(missing));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::validate_questions;
    use crate::synth::capability::{
        AnswerExtractor, CapabilityError, ExtractedAnswer, QuestionSynthesizer,
    };
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::sync::Arc;

    const PYTHON: &str = "Python is a programming language. It was created by Guido van Rossum.";

    const ARTICLE: &str = "Rust is a systems programming language focused on safety and speed. \
        The borrow checker enforces ownership rules at compile time so memory errors are caught early.\n\n\
        Cargo is the package manager used by the Rust community for building crates. \
        It was designed by the Rust project team to make dependency management predictable.\n\n\
        Ownership means each value has a single owner, and the value is dropped when that owner goes out of scope. \
        Borrowing lets code use a value without taking ownership of it.";

    struct FixedSynth(&'static str);

    impl QuestionSynthesizer for FixedSynth {
        fn synthesize(&self, _passage: &str, _rng: &mut dyn RngCore) -> Result<String, CapabilityError> {
            Ok(self.0.to_string())
        }
    }

    struct FixedExtractor(&'static str, f32);

    impl AnswerExtractor for FixedExtractor {
        fn extract(&self, _question: &str, _source: &str) -> Result<ExtractedAnswer, CapabilityError> {
            Ok(ExtractedAnswer {
                text: self.0.to_string(),
                confidence: self.1,
            })
        }
    }

    struct Broken;

    impl QuestionSynthesizer for Broken {
        fn synthesize(&self, _passage: &str, _rng: &mut dyn RngCore) -> Result<String, CapabilityError> {
            Err(CapabilityError::Failed("model crashed".into()))
        }
    }

    impl AnswerExtractor for Broken {
        fn extract(&self, _question: &str, _source: &str) -> Result<ExtractedAnswer, CapabilityError> {
            Err(CapabilityError::Failed("model crashed".into()))
        }
    }

    fn stubbed(question: &'static str, answer: &'static str, confidence: f32) -> Synthesizer {
        Synthesizer::new(
            SynthConfig::default(),
            Capabilities::new(
                Arc::new(FixedSynth(question)),
                Arc::new(FixedExtractor(answer, confidence)),
            ),
        )
    }

    fn assert_well_formed(questions: &[GeneratedQuestion]) {
        validate_questions(questions).unwrap();
        for q in questions {
            assert!(q.options.contains(&q.answer));
            assert!(q.options.iter().all(|o| !o.trim().is_empty()));
        }
    }

    #[test]
    fn cleans_stub_output_into_one_question() {
        let synth = stubbed("Who created <sep> Python?", "Guido van Rossum", 0.9);
        let mut rng = StdRng::seed_from_u64(42);
        let outcome = synth.assemble(PYTHON, 1, &mut rng).unwrap();

        assert_eq!(outcome.source, GenerationSource::Pipeline);
        assert_eq!(outcome.questions.len(), 1);
        let q = &outcome.questions[0];
        assert_eq!(q.question, "Who created Python?");
        assert_eq!(q.answer, "Guido van Rossum");
        assert_eq!(q.options.len(), 4);
        assert_eq!(q.options.iter().filter(|o| **o == q.answer).count(), 1);
        assert_well_formed(&outcome.questions);
    }

    #[test]
    fn rejects_empty_source_before_running() {
        let synth = stubbed("Who created Python?", "Guido van Rossum", 0.9);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            synth.assemble("", 3, &mut rng).unwrap_err(),
            GenerationError::EmptySource
        );
        assert_eq!(
            synth.assemble(" \n\t ", 3, &mut rng).unwrap_err(),
            GenerationError::EmptySource
        );
        assert!(matches!(
            synth.assemble(PYTHON, 0, &mut rng),
            Err(GenerationError::InvalidCount { requested: 0, .. })
        ));
        assert!(synth.assemble(PYTHON, 51, &mut rng).is_err());
    }

    #[test]
    fn failing_capabilities_exhaust_budget_then_fall_back() {
        let synth = Synthesizer::new(
            SynthConfig::default(),
            Capabilities::new(Arc::new(Broken), Arc::new(Broken)),
        );
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = synth.assemble(ARTICLE, 3, &mut rng).unwrap();

        assert_eq!(outcome.source, GenerationSource::ContentBased);
        assert_eq!(outcome.stats.attempts, 15);
        assert_eq!(outcome.stats.capability_errors, 15);
        assert_eq!(outcome.questions.len(), 3);
        assert_well_formed(&outcome.questions);
    }

    #[test]
    fn unusable_text_goes_straight_to_fallback() {
        let synth = Synthesizer::new(SynthConfig::default(), Capabilities::rule_based());
        let mut rng = StdRng::seed_from_u64(5);

        let outcome = synth.assemble("Rust is fast.", 2, &mut rng).unwrap();
        assert_eq!(outcome.source, GenerationSource::ContentBased);
        assert_eq!(outcome.stats.attempts, 0);
        assert_eq!(outcome.questions.len(), 2);

        let outcome = synth.assemble("a b c", 2, &mut rng).unwrap();
        assert_eq!(outcome.source, GenerationSource::Generic);
        assert_eq!(outcome.questions.len(), 2);
        assert_well_formed(&outcome.questions);
    }

    #[test]
    fn low_confidence_answers_are_dropped() {
        let synth = stubbed("Who created Python?", "Guido van Rossum", 0.01);
        let mut rng = StdRng::seed_from_u64(9);
        let outcome = synth.assemble(PYTHON, 2, &mut rng).unwrap();
        // first attempt is rejected for confidence, the rest as duplicates
        assert_eq!(outcome.stats.rejected_answers, 1);
        assert_eq!(outcome.stats.rejected_questions, 9);
        assert_eq!(outcome.source, GenerationSource::ContentBased);
    }

    #[test]
    fn pads_when_pipeline_runs_dry() {
        let synth = stubbed("Who created Python?", "Guido van Rossum", 0.9);
        let mut rng = StdRng::seed_from_u64(11);
        let outcome = synth.assemble(PYTHON, 4, &mut rng).unwrap();

        assert_eq!(outcome.source, GenerationSource::Pipeline);
        assert_eq!(outcome.questions.len(), 4);
        assert_eq!(outcome.questions[0].question, "Who created Python?");
        let distinct: HashSet<String> = outcome.questions.iter().map(|q| normalize_text(&q.question)).collect();
        assert_eq!(distinct.len(), 4);
        assert_well_formed(&outcome.questions);
    }

    #[test]
    fn placeholders_fill_missing_options() {
        let synth = stubbed("What does this text say?", "nothing", 0.9);
        let mut rng = StdRng::seed_from_u64(13);
        let options = synth.build_options("nothing", "one two six", &mut rng);
        let mut sorted = options.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["Option B", "Option C", "Option D", "nothing"]);
    }

    #[test]
    fn rule_based_run_keeps_invariants_and_is_reproducible() {
        let synth = Synthesizer::new(SynthConfig::default(), Capabilities::rule_based());
        for requested in [1, 3, 7] {
            let first = synth
                .assemble(ARTICLE, requested, &mut StdRng::seed_from_u64(21))
                .unwrap();
            let second = synth
                .assemble(ARTICLE, requested, &mut StdRng::seed_from_u64(21))
                .unwrap();
            assert_eq!(first.questions.len(), requested);
            assert_eq!(first.questions, second.questions);
            assert_well_formed(&first.questions);
        }
    }
}
