//! Scorecards and rank evaluation.
//!
//! A scorecard (`kind: ScorecardDefinition`) declares score definitions and
//! rank definitions. A rank turns an entity's score values into a graded
//! label in one of three modes:
//!
//! - `formula`: the formula is evaluated over the scores it references and
//!   the result is mapped through descending thresholds.
//! - `rules`: ordered `condition`/`formula` pairs; the first rule whose
//!   condition holds for the entity supplies the formula.
//! - `label_function`: a statement block that returns the label itself.
//!
//! Scorecards are compiled when loaded. Formula parse errors, unknown
//! identifiers and malformed thresholds are reported then; a rank that fails
//! to compile is skipped with a warning and the rest of its scorecard still
//! loads. Evaluation only ever fails for data reasons, which yields
//! [`RankOutcome::Unratable`].

pub mod formula;
pub mod label_function;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::catalog::{DEFAULT_NAMESPACE, Entity};
use crate::constants::MAX_RANK_RULES;
use crate::core::BkstgError;
use formula::{ENTITY_ATTRIBUTES, EntityContext, Env, EvalError, Expr, Value};
use label_function::LabelFunction;

/// Kind of scorecard definition documents.
pub const SCORECARD_KIND: &str = "ScorecardDefinition";

/// Lifecycle of a scorecard. Only active scorecards are evaluated during a
/// catalog load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorecardStatus {
    /// Being authored
    Draft,
    /// In use
    #[default]
    Active,
    /// Kept for history only
    Archived,
}

/// A discrete input level of a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreLevel {
    /// Display label
    pub label: String,
    /// Stored value
    pub value: f64,
}

/// A bounded numeric metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDefinition {
    /// Identifier referenced by entity scores and rank formulas
    pub id: String,
    /// Display name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entity kinds the score applies to; empty means all
    #[serde(default)]
    pub target_kinds: Vec<String>,
    #[serde(default)]
    pub min_value: f64,
    #[serde(default = "default_max_value")]
    pub max_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<ScoreLevel>>,
}

const fn default_max_value() -> f64 {
    100.0
}

/// One label boundary: values `>= min` get `label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankThreshold {
    /// Inclusive lower bound
    pub min: f64,
    /// Label
    pub label: String,
}

/// Variables a rank formula may use, bound to score ids.
///
/// Either a list, where each score id is also the variable name, or a map of
/// variable name to score id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreRefs {
    /// `[test_coverage, doc_quality]`
    List(Vec<String>),
    /// `{coverage: test_coverage}`
    Map(BTreeMap<String, String>),
}

impl Default for ScoreRefs {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl ScoreRefs {
    /// Variable name to score id.
    #[must_use]
    pub fn bindings(&self) -> BTreeMap<String, String> {
        match self {
            Self::List(ids) => ids.iter().map(|id| (id.clone(), id.clone())).collect(),
            Self::Map(map) => map.clone(),
        }
    }
}

/// One conditional rule of a rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankRule {
    /// Condition over `entity.*`; absent, empty or `True` always matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Formula used when the condition matches
    pub formula: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RankRule {
    fn is_default(&self) -> bool {
        self.condition
            .as_deref()
            .map(str::trim)
            .is_none_or(|c| c.is_empty() || c == "True" || c == "true")
    }
}

/// How a rank computes its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMode {
    /// One formula mapped through thresholds
    Formula,
    /// First matching conditional rule, mapped through thresholds
    Rules,
    /// Label returned by a statement block
    LabelFunction,
}

impl fmt::Display for RankMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Formula => "formula",
            Self::Rules => "rules",
            Self::LabelFunction => "label_function",
        })
    }
}

/// A derived, labelled metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankDefinition {
    /// Identifier
    pub id: String,
    /// Display name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entity kinds the rank applies to; empty means all
    #[serde(default)]
    pub target_kinds: Vec<String>,
    /// Scores the formula reads
    #[serde(default)]
    pub score_refs: ScoreRefs,
    /// Formula source, for the formula mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Ordered conditional rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RankRule>,
    /// Statement block returning the label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_function: Option<String>,
    /// Entity attributes the conditions and label function read
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_refs: Vec<String>,
    /// Label boundaries, highest first; unused by label functions
    #[serde(default)]
    pub thresholds: Vec<RankThreshold>,
}

impl RankDefinition {
    /// Whether the rank applies to entities of `kind`.
    #[must_use]
    pub fn applies_to(&self, kind: &str) -> bool {
        self.target_kinds.is_empty() || self.target_kinds.iter().any(|k| k.eq_ignore_ascii_case(kind))
    }

    /// The mode in effect: a label function wins over rules, rules over a
    /// formula.
    #[must_use]
    pub fn mode(&self) -> RankMode {
        if self.label_function.as_deref().is_some_and(|f| !f.trim().is_empty()) {
            RankMode::LabelFunction
        } else if !self.rules.is_empty() {
            RankMode::Rules
        } else {
            RankMode::Formula
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScorecardSpec {
    #[serde(default)]
    pub scores: Vec<ScoreDefinition>,
    #[serde(default)]
    pub ranks: Vec<RankDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorecardMetadata {
    /// Scorecard identifier
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A `ScorecardDefinition` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorecardDefinition {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    pub metadata: ScorecardMetadata,
    #[serde(default)]
    pub status: ScorecardStatus,
    #[serde(default)]
    pub spec: ScorecardSpec,
}

impl ScorecardDefinition {
    /// Scorecard identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.metadata.name
    }
}

/// Why an entity has no value for a rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnratableReason {
    /// A referenced score is absent or not applicable
    MissingScore {
        /// Score id
        score_id: String,
    },
    /// The formula divided by zero
    DivisionByZero,
    /// The formula produced NaN or infinity
    NonFinite,
    /// The value is below every threshold
    BelowThresholds {
        /// Computed value
        value: f64,
    },
    /// An operator or function got a value of the wrong type
    InvalidValue {
        /// Description
        message: String,
    },
    /// No conditional rule matched the entity
    NoMatchingRule,
    /// The label function returned no label
    NoLabel,
}

impl fmt::Display for UnratableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScore { score_id } => write!(f, "missing score '{score_id}'"),
            Self::DivisionByZero => f.write_str("division by zero"),
            Self::NonFinite => f.write_str("result is not a finite number"),
            Self::BelowThresholds { value } => write!(f, "value {value} is below the lowest threshold"),
            Self::InvalidValue { message } => f.write_str(message),
            Self::NoMatchingRule => f.write_str("no rule matches the entity"),
            Self::NoLabel => f.write_str("the label function returned no label"),
        }
    }
}

/// Result of rating one entity for one rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RankOutcome {
    /// A value and its label
    Rated {
        /// Formula result
        value: f64,
        /// Label of the highest threshold at or below `value`
        label: String,
    },
    /// A label chosen by a label function
    Labelled {
        /// Label
        label: String,
    },
    /// No label can be assigned
    Unratable {
        /// Why
        #[serde(flatten)]
        reason: UnratableReason,
    },
}

impl RankOutcome {
    /// Label, when rated.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Rated { label, .. } | Self::Labelled { label } => Some(label),
            Self::Unratable { .. } => None,
        }
    }

    /// Value, when rated.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        match self {
            Self::Rated { value, .. } => Some(*value),
            Self::Labelled { .. } | Self::Unratable { .. } => None,
        }
    }
}

impl fmt::Display for RankOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rated { value, label } => write!(f, "{label} ({value:.2})"),
            Self::Labelled { label } => f.write_str(label),
            Self::Unratable { reason } => write!(f, "unratable: {reason}"),
        }
    }
}

/// Maps `value` to the label of the highest threshold whose `min` it reaches.
///
/// `thresholds` must be sorted by descending `min`. Values below the lowest
/// threshold, and non-finite values, are unratable.
pub fn resolve_label(value: f64, thresholds: &[RankThreshold]) -> Result<&str, UnratableReason> {
    if !value.is_finite() {
        return Err(UnratableReason::NonFinite);
    }
    thresholds
        .iter()
        .find(|t| value >= t.min)
        .map(|t| t.label.as_str())
        .ok_or(UnratableReason::BelowThresholds { value })
}

fn validate_thresholds(rank_id: &str, thresholds: &[RankThreshold]) -> Result<(), BkstgError> {
    let invalid = |reason: String| BkstgError::InvalidRankDefinition {
        rank_id: rank_id.to_string(),
        reason,
    };
    if thresholds.is_empty() {
        return Err(invalid("no thresholds defined".to_string()));
    }
    if let Some(t) = thresholds.iter().find(|t| !t.min.is_finite()) {
        return Err(invalid(format!("threshold '{}' has a non-finite minimum", t.label)));
    }
    if let Some(pair) = thresholds.windows(2).find(|pair| pair[0].min <= pair[1].min) {
        return Err(invalid(format!(
            "thresholds must be strictly descending: '{}' ({}) is not above '{}' ({})",
            pair[0].label, pair[0].min, pair[1].label, pair[1].min
        )));
    }
    Ok(())
}

/// Parsed formulas and label functions keyed by source text and allowed
/// variables.
///
/// Shared across scorecard loads so that reloading unchanged scorecards does
/// not re-parse their formulas.
#[derive(Debug, Default)]
pub struct FormulaCache {
    parsed: DashMap<String, Arc<Expr>>,
    programs: DashMap<String, Arc<LabelFunction>>,
}

fn cache_key(source: &str, variables: &BTreeSet<String>) -> String {
    format!("{}\u{0}{source}", variables.iter().cloned().collect::<Vec<_>>().join(","))
}

impl FormulaCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `source`, or returns the tree from an earlier parse.
    pub fn compile(&self, source: &str, variables: &BTreeSet<String>) -> Result<Arc<Expr>, BkstgError> {
        let key = cache_key(source, variables);
        if let Some(expr) = self.parsed.get(&key) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(formula::parse(source, variables)?);
        self.parsed.insert(key, expr.clone());
        Ok(expr)
    }

    /// Parses a label function, or returns it from an earlier parse.
    pub fn compile_label_function(
        &self,
        source: &str,
        variables: &BTreeSet<String>,
    ) -> Result<Arc<LabelFunction>, BkstgError> {
        let key = cache_key(source, variables);
        if let Some(program) = self.programs.get(&key) {
            return Ok(program.clone());
        }
        let program = Arc::new(LabelFunction::parse(source, variables)?);
        self.programs.insert(key, program.clone());
        Ok(program)
    }

    /// Number of distinct formulas and label functions parsed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parsed.len() + self.programs.len()
    }

    /// Whether nothing was parsed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty() && self.programs.is_empty()
    }
}

impl From<&Entity> for EntityContext {
    fn from(entity: &Entity) -> Self {
        let spec = |key: &str| entity.spec.get(key).and_then(serde_yaml::Value::as_str).map(str::to_string);
        let metadata = |key: &str| {
            entity.metadata.extra.get(key).and_then(serde_yaml::Value::as_str).map(str::to_string)
        };
        let tags = entity
            .metadata
            .extra
            .get("tags")
            .and_then(serde_yaml::Value::as_sequence)
            .map(|tags| tags.iter().filter_map(serde_yaml::Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            kind: entity.kind.clone(),
            entity_type: spec("type"),
            lifecycle: spec("lifecycle"),
            owner: spec("owner"),
            system: spec("system"),
            domain: spec("domain"),
            namespace: entity.metadata.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            name: entity.metadata.name.clone(),
            title: metadata("title"),
            description: metadata("description"),
            tags,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    /// `None` for a default rule
    condition: Option<Arc<Expr>>,
    formula: Arc<Expr>,
}

#[derive(Debug, Clone)]
enum Evaluator {
    Formula(Arc<Expr>),
    Rules(Vec<CompiledRule>),
    LabelFunction(Arc<LabelFunction>),
}

/// A rank definition with its formulas compiled.
#[derive(Debug, Clone)]
pub struct CompiledRank {
    /// The definition
    pub definition: RankDefinition,
    evaluator: Evaluator,
    bindings: BTreeMap<String, String>,
}

impl CompiledRank {
    /// Compiles `definition`, validating formulas and thresholds.
    pub fn compile(definition: RankDefinition, cache: &FormulaCache) -> Result<Self, BkstgError> {
        let invalid = |reason: String| BkstgError::InvalidRankDefinition {
            rank_id: definition.id.clone(),
            reason,
        };
        let unknown = definition.entity_refs.iter().find(|a| !ENTITY_ATTRIBUTES.contains(&a.as_str()));
        if let Some(attribute) = unknown {
            return Err(invalid(format!("unknown entity attribute '{attribute}' in entity_refs")));
        }

        let bindings = definition.score_refs.bindings();
        let variables: BTreeSet<String> = bindings.keys().cloned().collect();
        let evaluator = match definition.mode() {
            RankMode::LabelFunction => {
                let source = definition.label_function.as_deref().unwrap_or_default();
                Evaluator::LabelFunction(cache.compile_label_function(source, &variables)?)
            }
            RankMode::Rules => {
                validate_thresholds(&definition.id, &definition.thresholds)?;
                if definition.rules.len() > MAX_RANK_RULES {
                    return Err(invalid(format!("more than {MAX_RANK_RULES} rules")));
                }
                let no_scores = BTreeSet::new();
                let mut rules = Vec::with_capacity(definition.rules.len());
                for rule in &definition.rules {
                    let condition = match rule.condition.as_deref() {
                        Some(condition) if !rule.is_default() => Some(cache.compile(condition, &no_scores)?),
                        _ => None,
                    };
                    rules.push(CompiledRule {
                        condition,
                        formula: cache.compile(&rule.formula, &variables)?,
                    });
                }
                Evaluator::Rules(rules)
            }
            RankMode::Formula => {
                let source = definition
                    .formula
                    .as_deref()
                    .filter(|f| !f.trim().is_empty())
                    .ok_or_else(|| invalid("no formula, rules or label_function defined".to_string()))?;
                validate_thresholds(&definition.id, &definition.thresholds)?;
                Evaluator::Formula(cache.compile(source, &variables)?)
            }
        };
        Ok(Self {
            definition,
            evaluator,
            bindings,
        })
    }

    /// Binds every referenced score; none is defaulted.
    fn bind<'a>(
        &self,
        scores: &HashMap<String, f64>,
        entity: Option<&'a EntityContext>,
    ) -> Result<Env<'a>, UnratableReason> {
        let mut env = Env::new(entity);
        for (variable, score_id) in &self.bindings {
            let value = scores.get(score_id).copied().filter(|v| v.is_finite()).ok_or_else(|| {
                UnratableReason::MissingScore {
                    score_id: score_id.clone(),
                }
            })?;
            env.bind(variable.clone(), Value::Number(value));
        }
        Ok(env)
    }

    fn unratable(&self, error: EvalError) -> UnratableReason {
        match error {
            EvalError::MissingVariable(variable) => UnratableReason::MissingScore {
                score_id: self.bindings.get(&variable).cloned().unwrap_or(variable),
            },
            EvalError::DivisionByZero => UnratableReason::DivisionByZero,
            EvalError::NonFinite => UnratableReason::NonFinite,
            EvalError::TypeMismatch(message) => UnratableReason::InvalidValue {
                message,
            },
        }
    }

    /// Picks the first rule whose condition holds and evaluates its formula.
    ///
    /// A rule whose condition or formula fails is passed over. When no rule
    /// produces a value, the last formula failure is reported, or
    /// [`UnratableReason::NoMatchingRule`] if none was tried.
    fn evaluate_rules(&self, rules: &[CompiledRule], env: &Env<'_>) -> Result<f64, UnratableReason> {
        let mut last_failure = None;
        for rule in rules {
            if let Some(condition) = &rule.condition {
                match condition.evaluate(env) {
                    Ok(value) if value.truthy() => {}
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("Rank '{}': rule condition failed: {e}", self.definition.id);
                        continue;
                    }
                }
            }
            match rule.formula.evaluate(env).and_then(|v| v.as_number()) {
                Ok(value) => return Ok(value),
                Err(e) => last_failure = Some(self.unratable(e)),
            }
        }
        Err(last_failure.unwrap_or(UnratableReason::NoMatchingRule))
    }

    /// Evaluates the numeric value over `scores` (score id to value), with
    /// `entity.*` read from `entity`.
    ///
    /// Label functions have no numeric value and yield
    /// [`UnratableReason::NoLabel`] here; use [`Self::rate_with`].
    pub fn evaluate(
        &self,
        scores: &HashMap<String, f64>,
        entity: Option<&EntityContext>,
    ) -> Result<f64, UnratableReason> {
        let env = self.bind(scores, entity)?;
        match &self.evaluator {
            Evaluator::Formula(expr) => {
                expr.evaluate(&env).and_then(|v| v.as_number()).map_err(|e| self.unratable(e))
            }
            Evaluator::Rules(rules) => self.evaluate_rules(rules, &env),
            Evaluator::LabelFunction(_) => Err(UnratableReason::NoLabel),
        }
    }

    /// Evaluates and labels without an entity; `entity.*` reads as `None`.
    #[must_use]
    pub fn rate(&self, scores: &HashMap<String, f64>) -> RankOutcome {
        self.rate_with(scores, None)
    }

    /// Evaluates and labels.
    #[must_use]
    pub fn rate_with(&self, scores: &HashMap<String, f64>, entity: Option<&EntityContext>) -> RankOutcome {
        let rated = match &self.evaluator {
            Evaluator::LabelFunction(program) => {
                let label = self.bind(scores, entity).and_then(|mut env| {
                    program.run(&mut env).map_err(|e| self.unratable(e))?.ok_or(UnratableReason::NoLabel)
                });
                return match label {
                    Ok(label) => RankOutcome::Labelled {
                        label,
                    },
                    Err(reason) => RankOutcome::Unratable {
                        reason,
                    },
                };
            }
            Evaluator::Formula(_) | Evaluator::Rules(_) => self.evaluate(scores, entity).and_then(|value| {
                resolve_label(value, &self.definition.thresholds).map(|label| (value, label.to_string()))
            }),
        };
        match rated {
            Ok((value, label)) => RankOutcome::Rated {
                value,
                label,
            },
            Err(reason) => RankOutcome::Unratable {
                reason,
            },
        }
    }
}

/// A rank left out of its scorecard because it failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRank {
    /// Rank identifier
    pub rank_id: String,
    /// Compile error
    pub reason: String,
}

/// A scorecard with its ranks compiled.
#[derive(Debug, Clone)]
pub struct CompiledScorecard {
    /// The definition
    pub definition: ScorecardDefinition,
    /// Compiled ranks in declaration order
    pub ranks: Vec<CompiledRank>,
    /// Ranks that failed to compile
    pub skipped: Vec<SkippedRank>,
}

impl CompiledScorecard {
    /// Compiles every rank of `definition`.
    ///
    /// A rank that fails to compile is logged and skipped; the others are
    /// kept.
    #[must_use]
    pub fn compile(definition: ScorecardDefinition, cache: &FormulaCache) -> Self {
        let mut ranks = Vec::with_capacity(definition.spec.ranks.len());
        let mut skipped = Vec::new();
        for rank in &definition.spec.ranks {
            match CompiledRank::compile(rank.clone(), cache) {
                Ok(compiled) => ranks.push(compiled),
                Err(e) => {
                    tracing::warn!("Skipping rank '{}' of scorecard '{}': {e}", rank.id, definition.id());
                    skipped.push(SkippedRank {
                        rank_id: rank.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Self {
            definition,
            ranks,
            skipped,
        }
    }

    /// Scorecard identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.definition.id()
    }

    /// Rank by identifier.
    #[must_use]
    pub fn rank(&self, rank_id: &str) -> Option<&CompiledRank> {
        self.ranks.iter().find(|r| r.definition.id == rank_id)
    }
}

/// Rating of one entity for one rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankResult {
    /// Scorecard identifier
    pub scorecard_id: String,
    /// Rank identifier
    pub rank_id: String,
    /// Outcome
    #[serde(flatten)]
    pub outcome: RankOutcome,
}

/// Loaded scorecards keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct Scorecards {
    cards: BTreeMap<String, CompiledScorecard>,
    cache: Arc<FormulaCache>,
}

impl Scorecards {
    /// Creates an empty set with its own formula cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set sharing `cache`.
    #[must_use]
    pub fn with_cache(cache: Arc<FormulaCache>) -> Self {
        Self {
            cards: BTreeMap::new(),
            cache,
        }
    }

    /// Compiles and adds a scorecard, replacing one with the same id.
    pub fn insert(&mut self, definition: ScorecardDefinition) {
        let compiled = CompiledScorecard::compile(definition, &self.cache);
        self.cards.insert(compiled.id().to_string(), compiled);
    }

    /// Parses every `ScorecardDefinition` document in `content` and adds it.
    pub fn insert_yaml(&mut self, content: &str) -> Result<usize> {
        let mut added = 0;
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_yaml::Value::deserialize(document).context("Invalid YAML")?;
            if value.get("kind").and_then(serde_yaml::Value::as_str) != Some(SCORECARD_KIND) {
                continue;
            }
            let definition: ScorecardDefinition =
                serde_yaml::from_value(value).context("Invalid scorecard definition")?;
            self.insert(definition);
            added += 1;
        }
        Ok(added)
    }

    /// Loads every scorecard file under `dir`.
    ///
    /// A file that fails to load is skipped with a warning; the returned list
    /// names it with the reason.
    pub fn load_dir(&mut self, dir: &Path) -> Vec<(std::path::PathBuf, String)> {
        let mut failures = Vec::new();
        if !dir.is_dir() {
            return failures;
        }
        let mut files: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .map(walkdir::DirEntry::into_path)
            .collect();
        files.sort();

        for file in files {
            let loaded = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))
                .and_then(|content| self.insert_yaml(&content));
            match loaded {
                Ok(count) => tracing::debug!("Loaded {count} scorecard(s) from {}", file.display()),
                Err(e) => {
                    tracing::warn!("Skipping scorecard file {}: {e:#}", file.display());
                    failures.push((file, format!("{e:#}")));
                }
            }
        }
        failures
    }

    /// Scorecard by identifier.
    pub fn get(&self, id: &str) -> Result<&CompiledScorecard, BkstgError> {
        self.cards.get(id).ok_or_else(|| BkstgError::ScorecardNotFound {
            id: id.to_string(),
        })
    }

    /// Active scorecards.
    pub fn active(&self) -> impl Iterator<Item = &CompiledScorecard> {
        self.cards.values().filter(|c| c.definition.status == ScorecardStatus::Active)
    }

    /// Every loaded scorecard.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledScorecard> {
        self.cards.values()
    }

    /// Number of scorecards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether no scorecard is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Rates `scores` for one rank of one scorecard.
    pub fn evaluate_rank(
        &self,
        scorecard_id: &str,
        rank_id: &str,
        scores: &HashMap<String, f64>,
    ) -> Result<RankResult, BkstgError> {
        let card = self.get(scorecard_id)?;
        let rank = card.rank(rank_id).ok_or_else(|| BkstgError::ScorecardNotFound {
            id: format!("{scorecard_id}/{rank_id}"),
        })?;
        Ok(RankResult {
            scorecard_id: scorecard_id.to_string(),
            rank_id: rank_id.to_string(),
            outcome: rank.rate(scores),
        })
    }

    /// Rates `scores` for every rank of one scorecard.
    pub fn evaluate_scorecard(
        &self,
        scorecard_id: &str,
        scores: &HashMap<String, f64>,
    ) -> Result<Vec<RankResult>, BkstgError> {
        let card = self.get(scorecard_id)?;
        Ok(card
            .ranks
            .iter()
            .map(|rank| RankResult {
                scorecard_id: scorecard_id.to_string(),
                rank_id: rank.definition.id.clone(),
                outcome: rank.rate(scores),
            })
            .collect())
    }

    /// Rates an entity for every applicable rank of every active scorecard.
    #[must_use]
    pub fn rate_entity(&self, entity: &Entity) -> Vec<RankResult> {
        let mut results = Vec::new();
        let context = EntityContext::from(entity);
        for card in self.active() {
            let scores = entity.score_values(Some(card.id()));
            for rank in card.ranks.iter().filter(|r| r.definition.applies_to(&entity.kind)) {
                results.push(RankResult {
                    scorecard_id: card.id().to_string(),
                    rank_id: rank.definition.id.clone(),
                    outcome: rank.rate_with(&scores, Some(&context)),
                });
            }
        }
        results
    }
}
