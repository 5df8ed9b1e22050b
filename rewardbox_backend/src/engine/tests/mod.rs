mod integration;
mod stress_tests;
