mod stream_tests;
