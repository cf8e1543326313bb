//! Single-elimination bracket over a set of generators.
//!
//! All generators receive the same prompt concurrently, then contestants are
//! paired in seed order (1v2, 3v4, ...) and judged. Matches within a round
//! run concurrently; a round must finish before the next one is paired,
//! because its winners are the next round's contestants.
//!
//! Generation is fail-fast: one failed generator aborts the tournament.

use crate::errors::TournamentError;
use crate::generator::{GenerationResult, Generator};
use crate::judge::{Judge, JudgeResult, Side};
use crate::llm::TokenCounter;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One bracket match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_name: String,
    pub contestant_a_id: String,
    pub contestant_b_id: String,
    pub winner_id: String,
    pub judge_result: JudgeResult,
}

impl MatchResult {
    /// Which side (if any) the given contestant played in this match.
    pub fn side_of(&self, contestant_id: &str) -> Option<Side> {
        if self.contestant_a_id == contestant_id {
            Some(Side::A)
        } else if self.contestant_b_id == contestant_id {
            Some(Side::B)
        } else {
            None
        }
    }
}

/// Terminal output of a tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentResult {
    pub champion_id: String,
    pub champion_text: String,
    pub rounds: Vec<MatchResult>,
    pub all_generations: Vec<GenerationResult>,
    pub total_tokens_used: u64,
}

impl TournamentResult {
    pub fn generation(&self, generator_id: &str) -> Option<&GenerationResult> {
        self.all_generations
            .iter()
            .find(|g| g.generator_id == generator_id)
    }
}

/// Name of a match given its round position.
///
/// The last round is `final`, the one before it `semifinal_N`, then
/// `quarterfinal_N`; earlier rounds are `round{R}_match{N}` (1-based).
pub fn match_name(round_index: usize, total_rounds: usize, match_index: usize) -> String {
    let number = match_index + 1;
    match total_rounds - round_index {
        1 => "final".to_string(),
        2 => format!("semifinal_{}", number),
        3 => format!("quarterfinal_{}", number),
        _ => format!("round{}_match{}", round_index + 1, number),
    }
}

pub struct TournamentArena {
    generators: Vec<Arc<dyn Generator>>,
    judge: Arc<dyn Judge>,
    counter: Arc<TokenCounter>,
}

impl TournamentArena {
    pub fn new(
        generators: Vec<Arc<dyn Generator>>,
        judge: Arc<dyn Judge>,
        counter: Arc<TokenCounter>,
    ) -> Self {
        Self {
            generators,
            judge,
            counter,
        }
    }

    pub fn generator_count(&self) -> usize {
        self.generators.len()
    }

    pub async fn run_tournament(&self, prompt: &str) -> Result<TournamentResult, TournamentError> {
        let count = self.generators.len();
        if count == 0 || !count.is_power_of_two() {
            return Err(TournamentError::InvalidBracketSize { count });
        }

        let snapshot = self.counter.snapshot();
        tracing::info!(generators = count, "Tournament started");

        let generations = try_join_all(self.generators.iter().map(|generator| async move {
            generator
                .generate_with_metadata(prompt)
                .await
                .map_err(|source| TournamentError::GenerationFailed {
                    generator_id: generator.id().to_string(),
                    source,
                })
        }))
        .await?;

        let total_rounds = count.trailing_zeros() as usize;
        let mut contestants: Vec<usize> = (0..count).collect();
        let mut rounds = Vec::with_capacity(count.saturating_sub(1));

        for round_index in 0..total_rounds {
            let matches = try_join_all(contestants.chunks(2).enumerate().map(
                |(match_index, pair)| {
                    let name = match_name(round_index, total_rounds, match_index);
                    self.run_match(name, &generations, pair[0], pair[1])
                },
            ))
            .await?;

            contestants = matches.iter().map(|(winner, _)| *winner).collect();
            rounds.extend(matches.into_iter().map(|(_, result)| result));
        }

        let champion = &generations[contestants[0]];
        let total_tokens_used = snapshot.delta(&self.counter);

        tracing::info!(
            champion = %champion.generator_id,
            matches = rounds.len(),
            tokens = total_tokens_used,
            "Tournament complete"
        );

        Ok(TournamentResult {
            champion_id: champion.generator_id.clone(),
            champion_text: champion.text.clone(),
            rounds,
            all_generations: generations,
            total_tokens_used,
        })
    }

    async fn run_match(
        &self,
        match_name: String,
        generations: &[GenerationResult],
        a: usize,
        b: usize,
    ) -> Result<(usize, MatchResult), TournamentError> {
        let (gen_a, gen_b) = (&generations[a], &generations[b]);

        let judge_result = self
            .judge
            .evaluate(&gen_a.text, &gen_b.text)
            .await
            .map_err(|source| TournamentError::JudgeFailed {
                match_name: match_name.clone(),
                source,
            })?;

        let (winner, winner_gen) = match judge_result.winner {
            Side::A => (a, gen_a),
            Side::B => (b, gen_b),
        };

        tracing::debug!(
            r#match = %match_name,
            a = %gen_a.generator_id,
            b = %gen_b.generator_id,
            winner = %winner_gen.generator_id,
            "Match decided"
        );

        Ok((
            winner,
            MatchResult {
                match_name,
                contestant_a_id: gen_a.generator_id.clone(),
                contestant_b_id: gen_b.generator_id.clone(),
                winner_id: winner_gen.generator_id.clone(),
                judge_result,
            },
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::judge::{ScoreBreakdown, SidePair};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    pub(crate) struct FixedGenerator {
        pub id: String,
        pub text: String,
        pub tokens: u64,
        pub counter: Arc<TokenCounter>,
        pub fail: bool,
    }

    impl FixedGenerator {
        pub fn new(id: &str, counter: &Arc<TokenCounter>) -> Self {
            Self {
                id: id.to_string(),
                text: format!("text from {}", id),
                tokens: 10,
                counter: counter.clone(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate_with_metadata(&self, _prompt: &str) -> Result<GenerationResult> {
            if self.fail {
                anyhow::bail!("generator offline");
            }
            self.counter.add(self.tokens);
            Ok(GenerationResult {
                generator_id: self.id.clone(),
                text: self.text.clone(),
                tokens_used: self.tokens,
            })
        }
    }

    /// Judge that always returns the same side and records each pairing.
    pub(crate) struct AlwaysJudge {
        pub side: Side,
        pub calls: Mutex<Vec<(String, String)>>,
        pub counter: Option<Arc<TokenCounter>>,
    }

    impl AlwaysJudge {
        pub fn new(side: Side) -> Self {
            Self {
                side,
                calls: Mutex::new(Vec::new()),
                counter: None,
            }
        }
    }

    #[async_trait]
    impl Judge for AlwaysJudge {
        async fn evaluate(&self, text_a: &str, text_b: &str) -> Result<JudgeResult> {
            self.calls
                .lock()
                .unwrap()
                .push((text_a.to_string(), text_b.to_string()));
            if let Some(ref counter) = self.counter {
                counter.add(5);
            }
            Ok(JudgeResult::new(
                self.side,
                "fixed",
                SidePair::new(ScoreBreakdown::uniform(0.9), ScoreBreakdown::uniform(0.9)),
            ))
        }
    }

    fn arena(n: usize, judge: Arc<dyn Judge>, counter: &Arc<TokenCounter>) -> TournamentArena {
        let generators = (1..=n)
            .map(|i| Arc::new(FixedGenerator::new(&format!("gen_{}", i), counter)) as Arc<dyn Generator>)
            .collect();
        TournamentArena::new(generators, judge, counter.clone())
    }

    #[tokio::test]
    async fn test_always_a_crowns_first_seed() {
        let counter = TokenCounter::shared();
        let judge = Arc::new(AlwaysJudge::new(Side::A));
        let result = arena(4, judge.clone(), &counter)
            .run_tournament("write a scene")
            .await
            .unwrap();

        assert_eq!(result.champion_id, "gen_1");
        assert_eq!(result.champion_text, "text from gen_1");
        let names: Vec<&str> = result.rounds.iter().map(|m| m.match_name.as_str()).collect();
        assert_eq!(names, ["semifinal_1", "semifinal_2", "final"]);
        assert_eq!(result.rounds[1].contestant_a_id, "gen_3");
        assert_eq!(result.rounds[1].contestant_b_id, "gen_4");
        assert_eq!(result.rounds[2].contestant_a_id, "gen_1");
        assert_eq!(result.rounds[2].contestant_b_id, "gen_3");
        assert_eq!(result.all_generations.len(), 4);
        assert_eq!(judge.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_always_b_crowns_last_seed() {
        let counter = TokenCounter::shared();
        let result = arena(4, Arc::new(AlwaysJudge::new(Side::B)), &counter)
            .run_tournament("p")
            .await
            .unwrap();
        assert_eq!(result.champion_id, "gen_4");
        assert_eq!(result.rounds[0].winner_id, "gen_2");
        assert_eq!(result.rounds[2].winner_id, "gen_4");
    }

    #[tokio::test]
    async fn test_tokens_are_run_delta() {
        let counter = TokenCounter::shared();
        counter.add(1_000);
        let mut judge = AlwaysJudge::new(Side::A);
        judge.counter = Some(counter.clone());
        let result = arena(4, Arc::new(judge), &counter)
            .run_tournament("p")
            .await
            .unwrap();
        // 4 generations x 10 + 3 matches x 5
        assert_eq!(result.total_tokens_used, 55);
    }

    #[tokio::test]
    async fn test_eight_generators_bracket_names() {
        let counter = TokenCounter::shared();
        let result = arena(8, Arc::new(AlwaysJudge::new(Side::A)), &counter)
            .run_tournament("p")
            .await
            .unwrap();
        let names: Vec<&str> = result.rounds.iter().map(|m| m.match_name.as_str()).collect();
        assert_eq!(
            names,
            [
                "quarterfinal_1",
                "quarterfinal_2",
                "quarterfinal_3",
                "quarterfinal_4",
                "semifinal_1",
                "semifinal_2",
                "final"
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_non_power_of_two() {
        let counter = TokenCounter::shared();
        let err = arena(3, Arc::new(AlwaysJudge::new(Side::A)), &counter)
            .run_tournament("p")
            .await
            .unwrap_err();
        assert!(matches!(err, TournamentError::InvalidBracketSize { count: 3 }));

        let err = arena(0, Arc::new(AlwaysJudge::new(Side::A)), &counter)
            .run_tournament("p")
            .await
            .unwrap_err();
        assert!(matches!(err, TournamentError::InvalidBracketSize { count: 0 }));
    }

    #[tokio::test]
    async fn test_generator_failure_aborts() {
        let counter = TokenCounter::shared();
        let mut broken = FixedGenerator::new("gen_2", &counter);
        broken.fail = true;
        let generators: Vec<Arc<dyn Generator>> = vec![
            Arc::new(FixedGenerator::new("gen_1", &counter)),
            Arc::new(broken),
        ];
        let judge = Arc::new(AlwaysJudge::new(Side::A));
        let err = TournamentArena::new(generators, judge.clone(), counter)
            .run_tournament("p")
            .await
            .unwrap_err();
        assert!(
            matches!(err, TournamentError::GenerationFailed { ref generator_id, .. } if generator_id == "gen_2")
        );
        assert!(judge.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_match_name_deep_bracket() {
        assert_eq!(match_name(0, 5, 3), "round1_match4");
        assert_eq!(match_name(2, 5, 0), "quarterfinal_1");
        assert_eq!(match_name(4, 5, 0), "final");
    }

    #[test]
    fn test_side_of() {
        let m = MatchResult {
            match_name: "final".into(),
            contestant_a_id: "x".into(),
            contestant_b_id: "y".into(),
            winner_id: "x".into(),
            judge_result: JudgeResult::fallback("t"),
        };
        assert_eq!(m.side_of("y"), Some(Side::B));
        assert_eq!(m.side_of("z"), None);
    }
}
