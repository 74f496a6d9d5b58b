#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod cookies;
pub mod driver;
pub mod extract;
pub mod formats;
pub mod html_driver;
pub mod inspect;
pub mod ledger;
pub mod logging;
pub mod scrape;
pub mod storage;
