mod eviction;
mod scheduling;
mod tiers;
mod utils;
