// Randomized operation sequences against the real engine, with the
// conservation audit run after every single operation. Anything the audit
// would catch in production gets caught here first.

mod operations;
