//! End-to-end calculation orchestration.
//!
//! One [`CalculationOrchestrator`] owns the pool registry and the release
//! store seam and runs the whole protocol for a calculation request:
//!
//! 1. locate (or recreate from the release workbook) the engine pool
//! 2. acquire an instance exclusively
//! 3. build (or accept pre-built) answer tables
//! 4. write question answers, then repeating answers, then rating-factor
//!    overrides, then read the output text
//! 5. release the instance on every path
//! 6. claim path: sanitize the output
//! 7. Development environment: validate output well-formedness
//!
//! Every range is fully rewritten on every call; the instance may carry
//! any previous caller's cell state. Callers that honor cancellation must
//! do so before invoking a calculation: the engine cannot be interrupted
//! mid-protocol, so nothing here checks for cancellation once an instance
//! is acquired.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{
    CalcResult, CalculationError, ConfigError, Diagnostics, PoolError,
};
use crate::logs::{log_error_ctx, log_info_ctx, log_success};
use crate::mapping::{map_question_sets, map_repeating_set};
use crate::model::{AppType, CalculationConfig, Environment, ReleaseContext, ReleaseStore};
use crate::pool::{EngineLease, PoolKey, PoolRegistry};
use crate::sanitize::sanitize_output;
use crate::table::AnswerTable;
use crate::validation::check_well_formed;

// =============================================================================
// Inputs & Outcome
// =============================================================================

/// Inputs for one calculation run.
///
/// The form model is required; answer tables are normally derived from it
/// but callers that already mapped them (the quote screen re-rates on
/// every answer change) can pass them through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationInput {
    /// The submitted form, keyed by field key.
    pub form_model: Value,

    /// Pre-built simple-field answers; mapped from the form when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_answers: Option<AnswerTable>,

    /// Pre-built repeating answers keyed by repeating set key; mapped
    /// from the form when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeating_answers: Option<HashMap<String, AnswerTable>>,

    /// Optional rating-factor overrides, applied after all answer writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_factors: Option<HashMap<String, Value>>,
}

impl CalculationInput {
    /// An input that derives everything from the form model.
    pub fn from_form(form_model: Value) -> Self {
        Self {
            form_model,
            question_answers: None,
            repeating_answers: None,
            rating_factors: None,
        }
    }

    /// Supply pre-built simple-field answers.
    pub fn with_question_answers(mut self, table: AnswerTable) -> Self {
        self.question_answers = Some(table);
        self
    }

    /// Supply pre-built repeating answers.
    pub fn with_repeating_answers(mut self, tables: HashMap<String, AnswerTable>) -> Self {
        self.repeating_answers = Some(tables);
        self
    }

    /// Supply rating-factor overrides.
    pub fn with_rating_factors(mut self, factors: HashMap<String, Value>) -> Self {
        self.rating_factors = Some(factors);
        self
    }
}

/// Result of a completed calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationOutcome {
    /// The engine's output text (sanitized on the claim path).
    pub calculation_json: String,
    /// The release the calculation actually ran against.
    pub release_id: String,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs calculations end-to-end against pooled engine instances.
pub struct CalculationOrchestrator {
    store: Arc<dyn ReleaseStore>,
    registry: Arc<PoolRegistry>,
}

impl CalculationOrchestrator {
    pub fn new(store: Arc<dyn ReleaseStore>, registry: Arc<PoolRegistry>) -> Self {
        Self { store, registry }
    }

    /// The pool registry, for host-driven eviction sweeps and stats.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Run a quote calculation.
    pub async fn quote_calculation(
        &self,
        ctx: &ReleaseContext,
        input: CalculationInput,
    ) -> CalcResult<CalculationOutcome> {
        self.run(ctx, AppType::Quote, input).await
    }

    /// Run a claim calculation from a raw form model.
    pub async fn claim_calculation(
        &self,
        ctx: &ReleaseContext,
        form_model: Value,
    ) -> CalcResult<String> {
        let outcome = self
            .run(ctx, AppType::Claim, CalculationInput::from_form(form_model))
            .await?;
        Ok(outcome.calculation_json)
    }

    async fn run(
        &self,
        ctx: &ReleaseContext,
        app_type: AppType,
        input: CalculationInput,
    ) -> CalcResult<CalculationOutcome> {
        let calculation_id = Uuid::new_v4().to_string();
        log_info_ctx(
            format!(
                "starting {app_type} calculation against release '{}'",
                ctx.release_id
            ),
            calculation_id.clone(),
        );

        let config = self.store.calculation_config(ctx, app_type)?;
        let key = PoolKey::new(ctx, app_type);

        // Locate the pool, recreating it from the release workbook if the
        // release was cached without one.
        let pool = self.registry.get_or_create(&key, || {
            if config.workbook.is_empty() {
                return Err(ConfigError::WorkbookMissing {
                    release_id: ctx.release_id.clone(),
                    environment: ctx.environment.to_string(),
                });
            }
            Ok(config.workbook.clone())
        })?;

        // A pool that exists but cannot produce an instance from its own
        // workbook means the release cache and the registry disagree;
        // surface that as the fatal configuration error it is.
        let mut lease = pool.acquire().await.map_err(|err| match err {
            PoolError::Build(build) => {
                log_error_ctx(
                    format!("engine pool could not be recreated: {build}"),
                    calculation_id.clone(),
                );
                CalculationError::Config(ConfigError::PoolUnavailable {
                    key: key.to_string(),
                    message: build.to_string(),
                })
            }
            other => CalculationError::Pool(other),
        })?;

        // Everything between acquire and release; the lease goes back
        // whatever happens inside.
        let driven = drive_instance(&mut lease, &config, &input, &calculation_id);
        pool.release(lease);
        let (raw, diagnostics) = driven?;

        // The engine is known to emit trailing commas on claim output.
        let output = match app_type {
            AppType::Claim => sanitize_output(&raw),
            AppType::Quote => raw,
        };

        // Only Development pays for a parse; elsewhere the output is
        // passed through on trust.
        if ctx.environment == Environment::Development {
            if let Err((kind, message)) = check_well_formed(&output) {
                log_error_ctx(
                    format!("calculation output failed validation: {kind}: {message}"),
                    calculation_id.clone(),
                );
                return Err(CalculationError::OutputValidation {
                    kind,
                    message,
                    diagnostics,
                });
            }
        }

        log_success(format!(
            "{app_type} calculation complete for release '{}'",
            ctx.release_id
        ));
        Ok(CalculationOutcome {
            calculation_json: output,
            release_id: ctx.release_id.clone(),
        })
    }
}

/// The strictly-ordered protocol against one checked-out instance:
/// question answers, repeating answers, rating factors, output read.
///
/// Any engine failure is enriched with both answer tables (tab-delimited,
/// pasteable into the workbook) before propagating.
fn drive_instance(
    lease: &mut EngineLease,
    config: &CalculationConfig,
    input: &CalculationInput,
    calculation_id: &str,
) -> CalcResult<(String, Diagnostics)> {
    let question_answers = match &input.question_answers {
        Some(table) => table.clone(),
        None => map_question_sets(&config.question_sets, &input.form_model)?,
    };

    let mut repeating_answers: Vec<(String, AnswerTable)> = Vec::new();
    for repeating in config.repeating_fields() {
        let set = &repeating.question_set;
        let table = match input
            .repeating_answers
            .as_ref()
            .and_then(|tables| tables.get(&set.key))
        {
            Some(table) => table.clone(),
            None => map_repeating_set(set, &input.form_model)?,
        };
        repeating_answers.push((set.key.clone(), table));
    }

    let diagnostics = build_diagnostics(calculation_id, &question_answers, &repeating_answers);
    let enrich = |stage: &'static str, diagnostics: &Diagnostics| {
        let diagnostics = diagnostics.clone();
        move |source| CalculationError::Engine {
            stage,
            source,
            diagnostics,
        }
    };

    let range = &config.answer_range;
    lease
        .patch_data(&range.worksheet, &range.table, &range.column, &question_answers)
        .map_err(enrich("question-set write", &diagnostics))?;

    for (set_key, table) in &repeating_answers {
        let range = config.repeating_ranges.get(set_key).ok_or_else(|| {
            ConfigError::RepeatingRangeMissing {
                set_key: set_key.clone(),
            }
        })?;
        lease
            .patch_data(&range.worksheet, &range.table, &range.column, table)
            .map_err(enrich("repeating-set write", &diagnostics))?;
    }

    if let Some(factors) = &input.rating_factors {
        if !factors.is_empty() {
            lease
                .update_additional_rating_factors(factors)
                .map_err(enrich("rating-factor update", &diagnostics))?;
        }
    }

    let output = lease
        .read_table_text_as_string(&config.output_range.worksheet, &config.output_range.table)
        .map_err(enrich("output read", &diagnostics))?;

    Ok((output, diagnostics))
}

/// Diagnostics attached to every failure past the mapping stage.
fn build_diagnostics(
    calculation_id: &str,
    question_answers: &AnswerTable,
    repeating_answers: &[(String, AnswerTable)],
) -> Diagnostics {
    let repeating_text = repeating_answers
        .iter()
        .map(|(key, table)| format!("[{key}]\n{}", table.to_tab_delimited()))
        .collect::<Vec<_>>()
        .join("\n\n");
    Diagnostics::new()
        .with("calculationId", calculation_id)
        .with("questionSetAnswers", question_answers.to_tab_delimited())
        .with("repeatingQuestionSetAnswers", repeating_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::{EngineCall, ScriptedFactory};
    use crate::error::{ErrorKind, MappingError};
    use crate::model::{
        DataStoringField, DataType, Field, QuestionSet, RangeRef, RepeatingField,
        RepeatingQuestionSet,
    };
    use crate::pool::PoolConfig;
    use serde_json::json;

    struct InMemoryStore {
        config: Arc<CalculationConfig>,
    }

    impl ReleaseStore for InMemoryStore {
        fn calculation_config(
            &self,
            _ctx: &ReleaseContext,
            _app_type: AppType,
        ) -> crate::error::ConfigResult<Arc<CalculationConfig>> {
            Ok(Arc::clone(&self.config))
        }
    }

    fn simple_config(workbook: &[u8]) -> CalculationConfig {
        CalculationConfig {
            question_sets: vec![QuestionSet::new(
                "applicant",
                vec![Field::DataStoring(
                    DataStoringField::new("age", DataType::Number).at(0, 5),
                )],
            )],
            answer_range: RangeRef::new("Inputs", "QuestionAnswers", "Value"),
            repeating_ranges: HashMap::new(),
            output_range: RangeRef::new("Outputs", "Calculation", "Value"),
            workbook: workbook.to_vec(),
        }
    }

    fn config_with_drivers(workbook: &[u8]) -> CalculationConfig {
        let drivers = RepeatingQuestionSet::new(
            "drivers",
            vec![Field::DataStoring(
                DataStoringField::new("name", DataType::String).at(1, 5).required(),
            )],
            2,
        );
        let mut config = simple_config(workbook);
        config.question_sets[0]
            .fields
            .push(Field::Repeating(RepeatingField::new("drivers", drivers).at(0, 6)));
        config
            .repeating_ranges
            .insert("drivers".into(), RangeRef::new("Inputs", "Drivers", "Value"));
        config
    }

    fn orchestrator(
        config: CalculationConfig,
        factory: ScriptedFactory,
    ) -> (CalculationOrchestrator, Arc<ScriptedFactory>) {
        let factory = Arc::new(factory);
        let registry = Arc::new(PoolRegistry::new(
            Arc::clone(&factory) as Arc<dyn crate::engine::EngineFactory>,
            PoolConfig {
                capacity: 1,
                acquire_timeout: std::time::Duration::from_secs(1),
            },
        ));
        let store = Arc::new(InMemoryStore {
            config: Arc::new(config),
        });
        (CalculationOrchestrator::new(store, registry), factory)
    }

    fn dev_ctx() -> ReleaseContext {
        ReleaseContext::new("acme", "home", Environment::Development, "r42")
    }

    fn prod_ctx() -> ReleaseContext {
        ReleaseContext::new("acme", "home", Environment::Production, "r42")
    }

    #[tokio::test]
    async fn test_end_to_end_quote() {
        let (orchestrator, factory) = orchestrator(
            simple_config(b"workbook"),
            ScriptedFactory::with_output(r#"{"premium": 421.5}"#),
        );
        let outcome = orchestrator
            .quote_calculation(&dev_ctx(), CalculationInput::from_form(json!({"age": 30})))
            .await
            .unwrap();

        assert_eq!(outcome.calculation_json, r#"{"premium": 421.5}"#);
        assert_eq!(outcome.release_id, "r42");

        let calls = factory.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0].1 {
            EngineCall::Patch { range, values } => {
                assert_eq!(range, "Inputs!QuestionAnswers[Value]");
                assert_eq!(values.rows, vec![vec![json!("Value")], vec![json!(30)]]);
            }
            other => panic!("expected question-set write, got {other:?}"),
        }
        assert_eq!(
            calls[1].1,
            EngineCall::Read {
                range: "Outputs!Calculation".into()
            }
        );
    }

    #[tokio::test]
    async fn test_protocol_write_order() {
        let (orchestrator, factory) = orchestrator(
            config_with_drivers(b"workbook"),
            ScriptedFactory::with_output("{}"),
        );
        let input = CalculationInput::from_form(json!({
            "age": 30,
            "drivers": [{"name": "Kim"}],
        }))
        .with_rating_factors(HashMap::from([("loading".into(), json!(1.1))]));

        orchestrator
            .quote_calculation(&dev_ctx(), input)
            .await
            .unwrap();

        let stages: Vec<&'static str> = factory
            .calls()
            .iter()
            .map(|(_, call)| match call {
                EngineCall::Patch { range, .. } if range.starts_with("Inputs!QuestionAnswers") => {
                    "questions"
                }
                EngineCall::Patch { .. } => "repeating",
                EngineCall::RatingFactors(_) => "factors",
                EngineCall::Read { .. } => "read",
            })
            .collect();
        assert_eq!(stages, vec!["questions", "repeating", "factors", "read"]);
    }

    #[tokio::test]
    async fn test_claim_output_is_sanitized() {
        let (orchestrator, _) = orchestrator(
            simple_config(b"workbook"),
            ScriptedFactory::with_output(r#"{"total": 5,}"#),
        );
        let output = orchestrator
            .claim_calculation(&prod_ctx(), json!({"age": 30}))
            .await
            .unwrap();
        assert_eq!(output, r#"{"total": 5}"#);
    }

    #[tokio::test]
    async fn test_quote_output_returned_verbatim() {
        // The trailing-comma repair is a claim-path behavior.
        let (orchestrator, _) = orchestrator(
            simple_config(b"workbook"),
            ScriptedFactory::with_output(r#"{"total": 5,}"#),
        );
        let outcome = orchestrator
            .quote_calculation(&prod_ctx(), CalculationInput::from_form(json!({"age": 30})))
            .await
            .unwrap();
        assert_eq!(outcome.calculation_json, r#"{"total": 5,}"#);
    }

    #[tokio::test]
    async fn test_dev_validation_attaches_answer_tables() {
        let (orchestrator, _) = orchestrator(
            simple_config(b"workbook"),
            ScriptedFactory::with_output(r#"{"premium": }"#),
        );
        let err = orchestrator
            .quote_calculation(&dev_ctx(), CalculationInput::from_form(json!({"age": 30})))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::OutputValidation);
        let diagnostics = err.diagnostics().unwrap();
        assert_eq!(diagnostics.get("questionSetAnswers"), Some("Value\n30"));
        assert!(diagnostics.get("calculationId").is_some());
    }

    #[tokio::test]
    async fn test_read_failure_still_releases_instance() {
        let factory = ScriptedFactory {
            fail_read: true,
            ..ScriptedFactory::with_output("{}")
        };
        let (orchestrator, _) = orchestrator(simple_config(b"workbook"), factory);
        let ctx = dev_ctx();

        let err = orchestrator
            .quote_calculation(&ctx, CalculationInput::from_form(json!({"age": 30})))
            .await
            .unwrap_err();
        match &err {
            CalculationError::Engine { stage, .. } => assert_eq!(*stage, "output read"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.diagnostics().is_some());

        // The instance went back despite the failure.
        let key = PoolKey::new(&ctx, AppType::Quote);
        let pool = orchestrator.registry().get(&key).unwrap();
        assert!(pool.is_fully_idle());
    }

    #[tokio::test]
    async fn test_instance_overflow_is_configuration_error() {
        let (orchestrator, _) = orchestrator(
            config_with_drivers(b"workbook"),
            ScriptedFactory::with_output("{}"),
        );
        let ctx = dev_ctx();
        let form = json!({
            "age": 30,
            "drivers": [{"name": "a"}, {"name": "b"}, {"name": "c"}],
        });

        let err = orchestrator
            .quote_calculation(&ctx, CalculationInput::from_form(form))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(
            err,
            CalculationError::Mapping(MappingError::TooManyInstances { .. })
        ));

        // Mapping failed after acquire; the instance still went back.
        let pool = orchestrator
            .registry()
            .get(&PoolKey::new(&ctx, AppType::Quote))
            .unwrap();
        assert!(pool.is_fully_idle());
    }

    #[tokio::test]
    async fn test_prebuilt_tables_are_written_verbatim() {
        let (orchestrator, factory) = orchestrator(
            simple_config(b"workbook"),
            ScriptedFactory::with_output("{}"),
        );
        let mut prebuilt = AnswerTable::single_column(2);
        prebuilt.set(1, 0, json!(99));
        let input =
            CalculationInput::from_form(json!({"age": 30})).with_question_answers(prebuilt.clone());

        orchestrator
            .quote_calculation(&dev_ctx(), input)
            .await
            .unwrap();

        match &factory.calls()[0].1 {
            EngineCall::Patch { values, .. } => assert_eq!(values, &prebuilt),
            other => panic!("expected write, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_workbook_is_configuration_error() {
        let (orchestrator, _) =
            orchestrator(simple_config(b""), ScriptedFactory::with_output("{}"));
        let err = orchestrator
            .quote_calculation(&dev_ctx(), CalculationInput::from_form(json!({"age": 30})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(
            err,
            CalculationError::Config(ConfigError::WorkbookMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_unbuildable_pool_is_internal_consistency_error() {
        let factory = ScriptedFactory {
            fail_build: true,
            ..ScriptedFactory::with_output("{}")
        };
        let (orchestrator, _) = orchestrator(simple_config(b"workbook"), factory);
        let err = orchestrator
            .quote_calculation(&dev_ctx(), CalculationInput::from_form(json!({"age": 30})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(
            err,
            CalculationError::Config(ConfigError::PoolUnavailable { .. })
        ));
    }
}
