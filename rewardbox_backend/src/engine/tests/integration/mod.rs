// End-to-end journeys through the synchronous engine core: issue, open,
// fulfill, claim, and every failure/recovery branch in between. Each test
// runs on its own thread, so the thread-local stable state starts fresh.

mod failure_recovery;
mod open_lifecycle;
