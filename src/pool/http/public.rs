#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    instance_id: String,
    healthy_credentials: usize,
}

#[derive(Debug, Serialize)]
struct CredentialResponse {
    credential: String,
}

#[derive(Debug, Deserialize)]
struct DonateRequest {
    #[serde(default)]
    key: String,
    #[serde(default, alias = "donorContact")]
    donor_contact: Option<String>,
}

#[derive(Debug, Serialize)]
struct DonateResponse {
    message: &'static str,
    id: String,
}

async fn health(State(state): State<PoolHttpState>) -> Result<Json<HealthResponse>, PublicError> {
    let healthy_credentials = state.pool.healthy_count().await.map_err(map_public_error)?;
    Ok(Json(HealthResponse {
        status: "ok",
        instance_id: state.pool.instance_id().to_string(),
        healthy_credentials,
    }))
}

async fn allocate_credential(
    State(state): State<PoolHttpState>,
) -> Result<impl IntoResponse, PublicError> {
    let request_id = generate_request_id();
    let allocation = state.pool.allocate().await.map_err(|err| {
        tracing::warn!(%request_id, error = %err, "allocation request failed");
        map_public_error(err)
    })?;
    tracing::debug!(
        %request_id,
        credential_id = %allocation.credential.id,
        "allocation request served"
    );
    Ok((
        request_id_headers(&request_id),
        Json(CredentialResponse {
            credential: allocation.credential.key,
        }),
    ))
}

async fn donate_credential(
    State(state): State<PoolHttpState>,
    payload: Result<Json<DonateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DonateResponse>), PublicError> {
    let Json(payload) = payload.map_err(reject_public_body)?;
    let credential = state
        .pool
        .donate(&payload.key, payload.donor_contact.as_deref())
        .await
        .map_err(map_public_error)?;
    Ok((
        StatusCode::CREATED,
        Json(DonateResponse {
            message: "credential validated and added, thank you for your donation",
            id: credential.id,
        }),
    ))
}
