//! Step executor
//!
//! Drives one run. Steps execute strictly in order; for each step:
//!
//! 1. governor check (deadline, token budget)
//! 2. interpolate `args` against inputs + earlier outputs
//! 3. resolve the credential and mint a token for the step's permission
//!    (cached per run: the same permission yields the same token)
//! 4. governor check again, plus the network allowlist for the handler's
//!    outbound URL
//! 5. invoke the handler under the remaining run deadline
//!
//! Any failure is caught here, recorded as an `error` trace entry, and the
//! remaining steps are recorded as `skipped`. Nothing escapes a run.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::result::RunAssembler;
use super::run::{Run, RunMode, RunRequest, RunStatus};
use super::trace::{TraceRecorder, TraceStatus};
use crate::config::{PlatformLimits, RuntimeConfig};
use crate::credential::{
    ConfigPlatformCredentials, CredentialResolver, CredentialVault, PlatformCredentialProvider,
};
use crate::error::{ErrorKind, ManifestError, RuntimeError, StepError, ToolError};
use crate::governor::{Budget, Governor};
use crate::handler::{HandlerRegistry, ToolHandler};
use crate::manifest::{validate_inputs, Engine, Manifest, RawManifest, RemoteTarget, Step, Validator};
use crate::remote::{RemoteAdapter, RemoteResponse};
use crate::template::TEMPLATE_RESOLVER;
use crate::token::{CapabilityToken, TokenMinter};

/// Trace label for a forwarded remote run
const REMOTE_TOOL: &str = "remote";

/// Per-run state; never shared between runs
struct RunContext {
    run_id: Uuid,
    user_id: Option<String>,
    mode: RunMode,
    fallback_allowed: bool,
    budget: Budget,
    grants: HashMap<String, CapabilityToken>,
    trace: TraceRecorder,
    /// Inputs plus every output so far (template lookups)
    scope: Map<String, Value>,
    /// Outputs only
    produced: Map<String, Value>,
}

pub struct Runtime {
    registry: Arc<HandlerRegistry>,
    resolver: CredentialResolver,
    minter: TokenMinter,
    governor: Governor,
    remote: RemoteAdapter,
}

impl Runtime {
    pub fn new(
        registry: HandlerRegistry,
        vault: Arc<dyn CredentialVault>,
        platform: Arc<dyn PlatformCredentialProvider>,
        limits: PlatformLimits,
    ) -> Self {
        let resolver = CredentialResolver::new(vault, platform, registry.provider_map());
        Self {
            registry: Arc::new(registry),
            resolver,
            minter: TokenMinter::new(limits.token_ttl_max()),
            governor: Governor::new(limits),
            remote: RemoteAdapter::new(),
        }
    }

    /// Platform keys and ceilings taken from the config
    pub fn from_config(
        config: &RuntimeConfig,
        registry: HandlerRegistry,
        vault: Arc<dyn CredentialVault>,
    ) -> Self {
        Self::new(
            registry,
            vault,
            Arc::new(ConfigPlatformCredentials::from_config(config)),
            config.limits.clone(),
        )
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn validate(&self, raw: &RawManifest) -> Result<Manifest, ManifestError> {
        Validator::new(&self.registry).validate(raw)
    }

    /// Validate, check inputs, execute. `Err` only for rejections (no run created).
    #[instrument(name = "run_app", skip_all, fields(app_id = %request.manifest.id, mode = %request.mode))]
    pub async fn run_app(&self, request: RunRequest) -> Result<Run, RuntimeError> {
        let manifest = self.validate(&request.manifest)?;

        let supplied = match (request.mode, manifest.sample_inputs()) {
            (RunMode::Try, Some(sample)) if request.inputs.is_empty() => sample.clone(),
            _ => request.inputs,
        };
        let inputs = validate_inputs(&manifest, &supplied)?;

        Ok(self
            .execute(
                &manifest,
                inputs,
                request.user_id,
                request.mode,
                request.fallback_allowed,
            )
            .await)
    }

    /// Execute a validated manifest against validated inputs
    pub async fn execute(
        &self,
        manifest: &Manifest,
        inputs: Map<String, Value>,
        user_id: Option<String>,
        mode: RunMode,
        fallback_allowed: bool,
    ) -> Run {
        let mut run = Run::new(manifest.id.clone(), user_id.clone(), mode, inputs.clone());
        run.transition(RunStatus::Running);

        let mut ctx = RunContext {
            run_id: run.id(),
            user_id,
            mode,
            fallback_allowed,
            budget: self.governor.budget(manifest, mode),
            grants: HashMap::new(),
            trace: TraceRecorder::new(),
            scope: inputs,
            produced: Map::new(),
        };

        info!(
            run_id = %ctx.run_id,
            app_id = %manifest.id,
            %mode,
            steps = manifest.steps.len(),
            timeout_ms = ctx.budget.timeout_ms(),
            "run started"
        );

        let failure = match &manifest.engine {
            Engine::Steps => self.run_steps(manifest, &mut ctx).await,
            Engine::Remote(target) => self.run_remote(manifest, target, &mut ctx).await,
        };

        let duration_ms = ctx.budget.elapsed().as_millis() as u64;
        let tokens_used = ctx.budget.tokens_used();
        RunAssembler::finish(
            &mut run,
            &manifest.outputs_schema,
            ctx.produced,
            failure,
            ctx.trace.into_entries(),
            duration_ms,
        );

        info!(
            run_id = %run.id(),
            status = %run.status(),
            duration_ms,
            tokens_used,
            "run finished"
        );
        run
    }

    async fn run_steps(&self, manifest: &Manifest, ctx: &mut RunContext) -> Option<ErrorKind> {
        for (idx, step) in manifest.steps.iter().enumerate() {
            let timer = ctx.trace.start(&step.tool);
            match self.run_step(idx + 1, step, ctx).await {
                Ok(tokens_used) => ctx.trace.ok(timer, tokens_used),
                Err(err) => {
                    let kind = err.kind();
                    log_failure(ctx.run_id, idx + 1, &step.tool, &err);
                    ctx.trace.error(timer, kind);
                    for rest in &manifest.steps[idx + 1..] {
                        ctx.trace.skip(&rest.tool);
                    }
                    return Some(kind);
                }
            }
        }
        None
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, step = step_no, tool = %step.tool))]
    async fn run_step(
        &self,
        step_no: usize,
        step: &Step,
        ctx: &mut RunContext,
    ) -> Result<Option<u64>, StepError> {
        ctx.budget.check_budget()?;

        let handler = self.registry.get(&step.tool).cloned().ok_or_else(|| {
            ToolError::invalid_input(format!("tool '{}' is not registered", step.tool))
        })?;

        let args = TEMPLATE_RESOLVER.resolve_args(&step.args, &ctx.scope)?;
        let token = self.grant(&step.tool, ctx).await?;

        ctx.budget.check_budget()?;
        if let Some(url) = handler.outbound_url(&args) {
            ctx.budget.check_url(&url)?;
        }

        let output = match tokio::time::timeout(ctx.budget.remaining(), handler.invoke(&token, &args)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    timeout_ms: ctx.budget.timeout_ms(),
                }
                .into())
            }
        };

        if let Some(tokens) = output.tokens_used {
            ctx.budget.record_tokens(tokens);
        }
        merge_outputs(step, handler.as_ref(), output.values, ctx)?;

        Ok(output.tokens_used)
    }

    /// Token for `permission` in this run: reused while valid, else resolved and minted
    async fn grant(
        &self,
        permission: &str,
        ctx: &mut RunContext,
    ) -> Result<CapabilityToken, StepError> {
        if let Some(token) = ctx.grants.get(permission) {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        let credential = self
            .resolver
            .resolve(
                ctx.user_id.as_deref(),
                permission,
                ctx.mode,
                ctx.fallback_allowed,
            )
            .await?;

        let token = self.minter.mint(
            ctx.run_id,
            permission,
            Arc::new(credential),
            ctx.budget.deadline(),
        );
        ctx.grants.insert(permission.to_string(), token.clone());
        Ok(token)
    }

    async fn run_remote(
        &self,
        manifest: &Manifest,
        target: &RemoteTarget,
        ctx: &mut RunContext,
    ) -> Option<ErrorKind> {
        let timer = ctx.trace.start(REMOTE_TOOL);
        match self.forward_remote(manifest, target, ctx).await {
            Ok(response) => {
                let tokens: u64 = response.trace.iter().filter_map(|t| t.tokens).sum();
                ctx.budget.record_tokens(tokens);

                let failed = response
                    .trace
                    .iter()
                    .filter(|t| t.status == TraceStatus::Error)
                    .count();
                if response.trace.is_empty() {
                    ctx.trace.ok(timer, (tokens > 0).then_some(tokens));
                } else {
                    for entry in response.trace {
                        ctx.trace.remote(entry);
                    }
                }
                ctx.produced.extend(response.outputs);

                if failed > 0 {
                    warn!(run_id = %ctx.run_id, failed, "remote app reported failed steps");
                    return Some(ErrorKind::Provider);
                }
                None
            }
            Err(err) => {
                let kind = err.kind();
                log_failure(ctx.run_id, 1, REMOTE_TOOL, &err);
                ctx.trace.error(timer, kind);
                Some(kind)
            }
        }
    }

    async fn forward_remote(
        &self,
        manifest: &Manifest,
        target: &RemoteTarget,
        ctx: &mut RunContext,
    ) -> Result<RemoteResponse, StepError> {
        ctx.budget.check_budget()?;

        let mut tokens = Vec::with_capacity(manifest.permissions.len());
        for permission in &manifest.permissions {
            tokens.push(self.grant(permission, ctx).await?);
        }

        ctx.budget.check_budget()?;
        ctx.budget.check_url(&target.url)?;

        let remaining = ctx.budget.remaining();
        let forward = self.remote.forward(target, &ctx.scope, &tokens, remaining);
        match tokio::time::timeout(remaining, forward).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(ToolError::Timeout {
                timeout_ms: ctx.budget.timeout_ms(),
            }
            .into()),
        }
    }
}

/// Store a step's result: `output: key` takes the primary value, otherwise
/// every declared output key is merged
fn merge_outputs(
    step: &Step,
    handler: &dyn ToolHandler,
    mut values: Map<String, Value>,
    ctx: &mut RunContext,
) -> Result<(), StepError> {
    let keys = handler.output_keys();

    let entries: Vec<(String, Value)> = match &step.output {
        Some(key) => {
            let primary = keys
                .first()
                .and_then(|k| values.remove(*k))
                .ok_or_else(|| ToolError::Provider {
                    reason: "handler returned no value".to_string(),
                })?;
            vec![(key.clone(), primary)]
        }
        None => keys
            .iter()
            .filter_map(|k| values.remove(*k).map(|v| (k.to_string(), v)))
            .collect(),
    };

    for (key, value) in entries {
        ctx.scope.insert(key.clone(), value.clone());
        ctx.produced.insert(key, value);
    }
    Ok(())
}

fn log_failure(run_id: Uuid, step: usize, tool: &str, err: &StepError) {
    let kind = err.kind();
    if kind.is_invariant_violation() {
        error!(%run_id, step, tool, error_kind = %kind, "capability token invariant violated");
    } else {
        warn!(%run_id, step, tool, error_kind = %kind, error = %err, "step failed");
    }
}
