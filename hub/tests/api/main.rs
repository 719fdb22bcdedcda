mod conversations;
mod helpers;
mod ws;
