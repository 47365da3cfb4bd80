fn ensure_operator_read(state: &PoolHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let assertion = state.operator_assertion(headers);
    if !assertion.is_operator {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ));
    }
    Ok(())
}

fn ensure_operator_write(state: &PoolHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let assertion = state.operator_assertion(headers);
    if !(assertion.is_operator && assertion.can_write) {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid admin token",
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ListCredentialsQuery {
    #[serde(default)]
    include_keys: bool,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    health: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddCredentialRequest {
    #[serde(default)]
    key: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    origin: Option<CredentialOrigin>,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateCredentialRequest {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    health: Option<HealthStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct ActivityQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ValidateAllQuery {
    #[serde(default)]
    scope: Option<ValidationScope>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageQuery {
    #[serde(default)]
    days: Option<u32>,
}

async fn list_credentials(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Query(query): Query<ListCredentialsQuery>,
) -> Result<Json<Vec<Credential>>, HttpError> {
    ensure_operator_read(&state, &headers)?;

    let origin = match query.origin.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => Some(CredentialOrigin::parse(raw).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unknown origin: {raw}"),
            )
        })?),
        None => None,
    };
    let health = match query.health.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => Some(HealthStatus::parse(raw).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unknown health status: {raw}"),
            )
        })?),
        None => None,
    };

    let mut credentials = state
        .pool
        .list_credentials()
        .await
        .map_err(map_pool_error)?;
    if let Some(origin) = origin {
        credentials.retain(|credential| credential.origin == origin);
    }
    if let Some(health) = health {
        credentials.retain(|credential| credential.health == health);
    }
    if !query.include_keys {
        credentials = credentials.into_iter().map(Credential::redacted).collect();
    }
    Ok(Json(credentials))
}

async fn add_credential(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    payload: Result<Json<AddCredentialRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AddedCredential>), HttpError> {
    ensure_operator_write(&state, &headers)?;
    let Json(payload) = payload.map_err(reject_admin_body)?;
    let mut added = state
        .pool
        .add_credential(
            &payload.key,
            payload.label.as_deref(),
            payload.origin.unwrap_or(CredentialOrigin::Admin),
        )
        .await
        .map_err(map_pool_error)?;
    added.credential = added.credential.redacted();
    Ok((StatusCode::CREATED, Json(added)))
}

async fn update_credential(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<UpdateCredentialRequest>, JsonRejection>,
) -> Result<Json<Credential>, HttpError> {
    ensure_operator_write(&state, &headers)?;
    let Json(payload) = payload.map_err(reject_admin_body)?;
    let credential = state
        .pool
        .update_credential(&id, payload.label.as_deref(), payload.health)
        .await
        .map_err(map_pool_error)?;
    Ok(Json(credential.redacted()))
}

async fn delete_credential(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpError> {
    ensure_operator_write(&state, &headers)?;
    state
        .pool
        .delete_credential(&id)
        .await
        .map_err(map_pool_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn validate_credential(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ValidationReport>, HttpError> {
    ensure_operator_write(&state, &headers)?;
    let report = state
        .pool
        .validate_credential(&id)
        .await
        .map_err(map_pool_error)?;
    Ok(Json(report))
}

async fn reactivate_credential(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Credential>, HttpError> {
    ensure_operator_write(&state, &headers)?;
    let credential = state.pool.reactivate(&id).await.map_err(map_pool_error)?;
    Ok(Json(credential.redacted()))
}

async fn validate_all_credentials(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Query(query): Query<ValidateAllQuery>,
) -> Result<Json<BulkValidationReport>, HttpError> {
    ensure_operator_write(&state, &headers)?;
    let report = state
        .pool
        .validate_all(query.scope.unwrap_or_default())
        .await
        .map_err(map_pool_error)?;
    Ok(Json(report))
}

async fn pool_stats(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
) -> Result<Json<PoolStats>, HttpError> {
    ensure_operator_read(&state, &headers)?;
    let stats = state.pool.pool_stats().await.map_err(map_pool_error)?;
    Ok(Json(stats))
}

async fn usage_report(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageReport>, HttpError> {
    ensure_operator_read(&state, &headers)?;
    let report = state
        .pool
        .usage_report(query.days)
        .await
        .map_err(map_pool_error)?;
    Ok(Json(report))
}

async fn instance_ledger(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
) -> Result<Json<UsageLedger>, HttpError> {
    ensure_operator_read(&state, &headers)?;
    let ledger = state.pool.ledger().await.map_err(map_pool_error)?;
    Ok(Json(ledger))
}

async fn aggregate_ledgers(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
) -> Result<Json<UsageAggregate>, HttpError> {
    ensure_operator_read(&state, &headers)?;
    let aggregate = state.pool.aggregate().await.map_err(map_pool_error)?;
    Ok(Json(aggregate))
}

async fn recent_activity(
    State(state): State<PoolHttpState>,
    headers: HeaderMap,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityEvent>>, HttpError> {
    ensure_operator_read(&state, &headers)?;
    let events = state
        .pool
        .recent_activity(query.limit)
        .await
        .map_err(map_pool_error)?;
    Ok(Json(events))
}
