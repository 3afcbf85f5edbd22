mod helpers;
mod lifecycle;
mod manager_api;
mod proxy;
