//! Role-based allow/deny checks.

use async_trait::async_trait;
use serde::Deserialize;

use super::{config_for, misconfigured, Validator};
use crate::context::{is_truthy, EvalContext};
use crate::error::ValidatorError;
use crate::types::{Rule, ValidationResult, ValidationType};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RoleConfig {
    role_field: Option<String>,
    /// Restrict the rule to these operations (empty = all)
    operations: Vec<String>,
    /// Restrict the rule to these target tables (empty = all)
    tables: Vec<String>,
    forbidden_roles: Vec<String>,
    allowed_roles: Vec<String>,
    /// Roles that may only recommend, never execute
    recommend_only_roles: Vec<String>,
    recommendation_field: Option<String>,
    destructive_guard: Option<DestructiveGuard>,
}

#[derive(Debug, Deserialize)]
struct DestructiveGuard {
    protected_category: String,
    #[serde(default)]
    category_field: Option<String>,
    #[serde(default = "default_destructive_operations")]
    operations: Vec<String>,
    #[serde(default)]
    allowed_roles: Vec<String>,
}

fn default_destructive_operations() -> Vec<String> {
    vec!["delete".into(), "drop".into(), "truncate".into()]
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(value))
}

/// Validator for `role_forbidden` rules.
pub struct RoleForbiddenValidator;

#[async_trait]
impl Validator for RoleForbiddenValidator {
    fn validation_type(&self) -> ValidationType {
        ValidationType::RoleForbidden
    }

    async fn validate(
        &self,
        rule: &Rule,
        ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError> {
        let Some(config) = config_for::<RoleConfig>(rule) else {
            return Ok(misconfigured(rule));
        };
        if config.forbidden_roles.is_empty()
            && config.allowed_roles.is_empty()
            && config.recommend_only_roles.is_empty()
            && config.destructive_guard.is_none()
        {
            return Ok(ValidationResult::pass("No role restrictions configured"));
        }

        let operation = ctx.operation_type().unwrap_or_default();
        if !config.operations.is_empty() && !contains_ignore_case(&config.operations, operation) {
            return Ok(ValidationResult::pass(format!(
                "Operation {} not covered by rule",
                operation
            )));
        }
        let target = ctx.target().unwrap_or_default();
        if !config.tables.is_empty() && !contains_ignore_case(&config.tables, target) {
            return Ok(ValidationResult::pass(format!(
                "Target {} not covered by rule",
                target
            )));
        }

        let role_field = config.role_field.as_deref().unwrap_or("actor_role");
        let role = ctx.get_str(role_field);

        if let Some(role) = role.filter(|r| contains_ignore_case(&config.forbidden_roles, r)) {
            return Ok(ValidationResult::fail(format!(
                "Role {} is forbidden from {} on {}",
                role, operation, target
            ))
            .with_detail("role", role));
        }

        if !config.allowed_roles.is_empty() {
            match role {
                Some(r) if contains_ignore_case(&config.allowed_roles, r) => {}
                Some(r) => {
                    return Ok(ValidationResult::fail(format!(
                        "Role {} is not allowed to perform {}",
                        r, operation
                    ))
                    .with_detail("role", r)
                    .with_detail("allowed_roles", config.allowed_roles.clone()));
                }
                None => {
                    return Ok(ValidationResult::fail(format!(
                        "Missing required field: {}",
                        role_field
                    )));
                }
            }
        }

        if let Some(role) = role.filter(|r| contains_ignore_case(&config.recommend_only_roles, r)) {
            let field = config
                .recommendation_field
                .as_deref()
                .unwrap_or("is_recommendation");
            let recommending = ctx.lookup(field).map(is_truthy).unwrap_or(false);
            if !recommending {
                return Ok(ValidationResult::fail(format!(
                    "Role {} may only recommend, not execute {}",
                    role, operation
                ))
                .with_detail("role", role));
            }
        }

        if let Some(guard) = &config.destructive_guard {
            if let Some(result) = check_destructive(guard, operation, role, ctx) {
                return Ok(result);
            }
        }

        Ok(ValidationResult::pass("Role permitted"))
    }
}

fn check_destructive(
    guard: &DestructiveGuard,
    operation: &str,
    role: Option<&str>,
    ctx: &EvalContext,
) -> Option<ValidationResult> {
    let category_field = guard.category_field.as_deref().unwrap_or("resource_category");
    let category = ctx.get_str(category_field)?;
    if !category.eq_ignore_ascii_case(&guard.protected_category) {
        return None;
    }

    let lowered = operation.to_lowercase();
    let destructive = guard
        .operations
        .iter()
        .any(|op| lowered.contains(&op.to_lowercase()));
    if !destructive {
        return None;
    }

    let permitted = role
        .map(|r| contains_ignore_case(&guard.allowed_roles, r))
        .unwrap_or(false);
    (!permitted).then(|| {
        ValidationResult::fail(format!(
            "Destructive operation {} on protected {} resource requires an authorized role",
            operation, category
        ))
        .with_detail("category", category)
        .with_detail("role", role.unwrap_or_default())
    })
}
