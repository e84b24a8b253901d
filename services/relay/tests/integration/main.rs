mod helpers;
mod poller_test;
