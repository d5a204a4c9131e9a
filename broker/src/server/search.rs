//! Catalogue search handlers.

use std::sync::Arc;

use axum::extract::State;
use numio_api::server::{NxJson, NxQuery};
use numio_api_core::error::ApiError;
use numio_api_core::models::{
    CountriesResponse, ProvidersResponse, SearchCountriesParams,
    SearchProvidersParams, SearchServicesParams, ServiceAggregateRow,
    ServiceSort,
};
use numio_api_core::types::Paginated;

use crate::context::AppContext;
use crate::server::AuthedUser;

pub async fn services(
    State(ctx): State<Arc<AppContext>>,
    _user: AuthedUser,
    NxQuery(params): NxQuery<SearchServicesParams>,
) -> Result<NxJson<Paginated<ServiceAggregateRow>>, ApiError> {
    let page = ctx
        .search
        .search_services(
            params.q.as_deref(),
            params.sort.unwrap_or(ServiceSort::Name),
            params.page_request(),
        )
        .await?;
    Ok(NxJson(page))
}

pub async fn countries(
    State(ctx): State<Arc<AppContext>>,
    _user: AuthedUser,
    NxQuery(params): NxQuery<SearchCountriesParams>,
) -> Result<NxJson<CountriesResponse>, ApiError> {
    let countries = ctx
        .search
        .search_countries(&params.service, params.q.as_deref())
        .await?;
    let total = countries.len() as u64;
    Ok(NxJson(CountriesResponse { countries, total }))
}

pub async fn providers(
    State(ctx): State<Arc<AppContext>>,
    _user: AuthedUser,
    NxQuery(params): NxQuery<SearchProvidersParams>,
) -> Result<NxJson<ProvidersResponse>, ApiError> {
    let providers = ctx
        .search
        .search_providers(&params.service, &params.country)
        .await?;
    let total = providers.len() as u64;
    Ok(NxJson(ProvidersResponse { providers, total }))
}
