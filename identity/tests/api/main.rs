mod helpers;
mod provider;
mod token;
